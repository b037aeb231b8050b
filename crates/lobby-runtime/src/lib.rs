// lobby-runtime: OS-facing leaves (spawn, /proc, signals, wg-quick) and the
// two managers built on them.

pub mod metrics;
pub mod process;
pub mod shell;
pub mod sweep;
pub mod vpn;

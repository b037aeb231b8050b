pub mod os;
pub mod sampler;
pub mod supervisor;

pub use supervisor::ProcessSupervisor;

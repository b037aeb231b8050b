use colored::Colorize;

// ---------------------------------------------------------------------------
// Colored message helpers
// ---------------------------------------------------------------------------

fn prefix() -> String {
    "[lobby]".bold().cyan().to_string()
}

/// Print an informational message: [lobby] message
pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

/// Print a success message: [lobby] message (in green)
pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

/// Print an error message: [lobby] ERROR: message (in red)
pub fn error(msg: &str) {
    eprintln!("{} {}", "[lobby]".bold().red(), msg.red());
}

/// Print a warning message: [lobby] message (in yellow)
pub fn warn(msg: &str) {
    println!("{} {}", prefix(), msg.yellow());
}

// ---------------------------------------------------------------------------
// Banner
// ---------------------------------------------------------------------------

/// Print a green bold banner box.
pub fn banner(lines: &[&str]) {
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    let rule = "=".repeat(width);

    println!();
    println!("{}", rule.bold().green());
    for line in lines {
        let pad = width - line.len() - 4;
        println!(
            "{}",
            format!("  {}{}  ", line, " ".repeat(pad)).bold().green()
        );
    }
    println!("{}", rule.bold().green());
    println!();
}

// ---------------------------------------------------------------------------
// Status block
// ---------------------------------------------------------------------------

/// Print a bold title over a dimmed rule.
pub fn status_header(title: &str) {
    println!("{}", title.bold());
    println!("{}", "-".repeat(title.len()).dimmed());
}

/// Print a status line with a bold label and a colored value.
pub fn status_line(label: &str, value: &str) {
    println!("{} {}", format!("{:<14}", label).bold(), colorize_value(value));
}

/// Color process statuses, health buckets, and yes/no answers.
fn colorize_value(value: &str) -> String {
    match value {
        "running" | "healthy" | "exited" | "yes" => value.green().to_string(),
        "launching" | "warning" | "terminated" => value.yellow().to_string(),
        "crashed" | "critical" | "no" => value.red().to_string(),
        "-" => value.dimmed().to_string(),
        _ => value.to_string(),
    }
}

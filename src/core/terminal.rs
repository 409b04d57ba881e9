use console::{Emoji, StyledObject, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static LOOM: Emoji<'_, '_> = Emoji("🧶 ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_banner() {
    println!(
        "\n{} {} {}\n",
        LOOM,
        style("runloom").bold().magenta(),
        style("agent run orchestrator").dim()
    );
}

pub fn print_goodbye() {
    println!("\n{} {}", LOOM, style("runloom stopped.").bold().cyan());
}

/// Colour a run or job status the same way everywhere it is printed.
pub fn status_style(status: &str) -> StyledObject<&str> {
    match status {
        "completed" | "succeeded" | "enqueued" => style(status).green().bold(),
        "failed" | "dead" => style(status).red().bold(),
        "cancelled" | "dropped" => style(status).yellow(),
        "running" | "retrying" | "cancelled_previous" => style(status).cyan(),
        _ => style(status).dim(),
    }
}

/// Titled block of label/value lines, commands or free text.
pub struct GuideSection {
    title: String,
    lines: Vec<String>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(format!("  {} {}: {}", GEAR, style(label).bold().cyan(), value));
        self
    }

    pub fn command(mut self, name: &str, about: &str) -> Self {
        self.lines
            .push(format!("  {:<28} {}", style(name).green(), style(about).dim()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        for line in text.lines() {
            self.lines.push(format!("  {}", line));
        }
        self
    }

    pub fn print(self) {
        println!("\n{}", style(&self.title).bold().underlined());
        for line in self.lines {
            println!("{}", line);
        }
    }
}

mod client;
mod serve;

use anyhow::Result;
use console::style;

use crate::config::{OrchestratorConfig, data_dir};
use crate::core::terminal::{self, GuideSection};
use crate::logging;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("serve", "Start workers, trigger scheduler and API")
        .print();

    GuideSection::new("Agent versions")
        .command("version publish <agent> <file>", "Publish an immutable version from TOML")
        .command("version get <version_id>", "Show a published version")
        .command("version list <agent>", "List an agent's versions")
        .command("version latest <agent>", "Show an agent's newest version")
        .print();

    GuideSection::new("Runs")
        .command("run submit <version_id>", "Queue a run (--input <json>, --wait)")
        .command("run status <run_id>", "Show run, job, transcript and events")
        .command("run list", "Recent runs (--limit <n>)")
        .command("run cancel <run_id>", "Cancel a queued or running run")
        .print();

    GuideSection::new("Triggers")
        .command("trigger list", "List registered triggers")
        .command("trigger create --json <spec>", "Register a schedule or event trigger")
        .command("trigger delete <trigger_id>", "Remove a trigger")
        .command("trigger fire <trigger_id>", "Fire a trigger now")
        .command("trigger fires <trigger_id>", "Show a trigger's fire history")
        .command("event <source> --json <payload>", "Deliver an event to matching triggers")
        .print();

    println!(
        "\n {} {} <command> [subcommand] [--api-url <url>]\n",
        style("Usage:").bold(),
        style("runloom").green()
    );
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "serve" => {
            let dir = data_dir();
            let config = OrchestratorConfig::load(&dir).await?;
            logging::init(&config.logging.level, config.logging.file.as_deref(), false);
            serve::run_serve(&dir, config, &args).await
        }
        "version" | "versions" | "run" | "runs" | "trigger" | "triggers" | "event" => {
            logging::init("warn", None, false);
            client::run_client_command(&args).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            terminal::print_error(&format!("Unknown command '{}'", other));
            print_help();
            Ok(())
        }
    }
}

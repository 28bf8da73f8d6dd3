use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "companion-daemon")]
#[command(about = "Scheduled delivery of periodic reports to registered recipients.")]
pub(crate) struct Cli {
    /// Path to companion.toml (default: $COMPANION_CONFIG or ~/.companion/companion.toml).
    #[arg(long, global = true)]
    pub(crate) config: Option<String>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run the background orchestrator until Ctrl+C / SIGTERM.
    /// SIGUSR1 signals foreground, SIGUSR2 background.
    Run,
    /// Print run config, recipient and queue statistics.
    Status,
    /// Run one full pass now, bypassing the interval gate.
    ForceRun,
    /// Enable background passes.
    Enable,
    /// Disable background passes.
    Disable,
    /// Set the run interval in minutes (minimum 15).
    Interval { minutes: u32 },
    /// Schedule the next pass at a local time of day, e.g. 07:30.
    ScheduleAt {
        #[arg(value_parser = parse_time_of_day)]
        time: (u32, u32),
    },
    /// Print the most recent pass results.
    History,
    /// Manage recipients.
    #[command(subcommand)]
    Recipient(RecipientCommand),
    /// Show or change the delivery system settings.
    #[command(subcommand)]
    System(SystemCommand),
    /// Inspect or maintain the delivery queue.
    #[command(subcommand)]
    Queue(QueueCommand),
}

#[derive(Subcommand, Debug)]
pub(crate) enum RecipientCommand {
    /// Register a recipient. Without period flags all periods are enabled.
    Add {
        address: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        daily: bool,
        #[arg(long)]
        weekly: bool,
        #[arg(long)]
        monthly: bool,
    },
    List,
    Remove { id: String },
    /// Flip the enabled switch.
    Toggle { id: String },
    /// Confirm a recipient with the token issued at registration.
    Verify { id: String, token: String },
    /// Change period subscriptions.
    Periods {
        id: String,
        #[arg(long)]
        daily: Option<bool>,
        #[arg(long)]
        weekly: Option<bool>,
        #[arg(long)]
        monthly: Option<bool>,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum SystemCommand {
    Show,
    Set {
        #[arg(long)]
        enabled: Option<bool>,
        /// Fixed UTC offset, e.g. UTC, +02:00, -03:00.
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        sending_hour: Option<u32>,
        #[arg(long)]
        max_per_pass: Option<u32>,
        #[arg(long)]
        retry_attempts: Option<u32>,
        #[arg(long)]
        retry_backoff_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum QueueCommand {
    Stats,
    List,
    /// Delete sent/failed jobs older than the given number of days.
    Prune {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Delete every job.
    Clear,
}

fn parse_time_of_day(s: &str) -> Result<(u32, u32), String> {
    let (h, m) = s.split_once(':').unwrap_or((s, "0"));
    let hour: u32 = h.trim().parse().map_err(|_| format!("bad hour in '{s}'"))?;
    let minute: u32 = m.trim().parse().map_err(|_| format!("bad minute in '{s}'"))?;
    if hour > 23 || minute > 59 {
        return Err(format!("time out of range: '{s}'"));
    }
    Ok((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_of_day() {
        assert_eq!(parse_time_of_day("07:30"), Ok((7, 30)));
        assert_eq!(parse_time_of_day("19"), Ok((19, 0)));
        assert!(parse_time_of_day("24:00").is_err());
        assert!(parse_time_of_day("ab:00").is_err());
    }

    #[test]
    fn parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "companion-daemon",
            "recipient",
            "periods",
            "abc",
            "--weekly",
            "false",
        ])
        .unwrap();
        match cli.command {
            Command::Recipient(RecipientCommand::Periods { id, weekly, daily, .. }) => {
                assert_eq!(id, "abc");
                assert_eq!(weekly, Some(false));
                assert_eq!(daily, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["companion-daemon", "queue", "prune", "--days", "7"]).unwrap();
        assert!(matches!(cli.command, Command::Queue(QueueCommand::Prune { days: 7 })));
    }
}

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::{Parser, Subcommand};

use relay_core::{RelayConfig, RelayCore, StderrReporter};

#[derive(Parser, Debug)]
#[command(name = "relay-cli", version)]
#[command(about = "Operator CLI for a Relay message bus instance")]
struct Cli {
    /// Data directory for the relay instance (Maildir + index.db).
    #[arg(long, default_value = ".relay-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List messages in an endpoint's mailbox.
    Mailbox {
        /// Registered subject, e.g. relay.agent.alice
        subject: String,
        #[arg(long, value_enum, default_value = "new")]
        status: MailboxStatus,
    },
    /// Dead-letter queue operations.
    Dlq {
        #[command(subcommand)]
        cmd: DlqCommands,
    },
    /// Access-rule operations.
    Rules {
        #[command(subcommand)]
        cmd: RulesCommands,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum MailboxStatus {
    New,
    Cur,
    Failed,
}

#[derive(Subcommand, Debug)]
enum DlqCommands {
    /// List dead letters, optionally scoped to one endpoint.
    List {
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Purge dead letters older than `max_age_ms`.
    Purge {
        #[arg(long)]
        max_age_ms: i64,
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum RulesCommands {
    /// List every configured access rule.
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::load_from_file(&cli.data_dir.join(".relay.toml"))
        .unwrap_or_else(|_| RelayConfig::new(&cli.data_dir));
    let reporter = Arc::new(Mutex::new(StderrReporter));
    let core = RelayCore::open(config, reporter)?;

    match cli.cmd {
        Commands::Mailbox { subject, status } => mailbox_ls(&core, &subject, status)?,
        Commands::Dlq { cmd } => match cmd {
            DlqCommands::List { endpoint } => dlq_list(&core, endpoint.as_deref())?,
            DlqCommands::Purge { max_age_ms, endpoint } => dlq_purge(&core, max_age_ms, endpoint.as_deref())?,
        },
        Commands::Rules { cmd } => match cmd {
            RulesCommands::List => rules_list(&core),
        },
    }

    Ok(())
}

fn mailbox_ls(core: &RelayCore, subject: &str, status: MailboxStatus) -> Result<()> {
    let hash = relay_types::endpoint_hash(subject);
    let ids = match status {
        MailboxStatus::New => core.maildir().list_new(&hash)?,
        MailboxStatus::Cur => core.maildir().list_current(&hash)?,
        MailboxStatus::Failed => core.maildir().list_failed(&hash)?,
    };
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

fn dlq_list(core: &RelayCore, endpoint: Option<&str>) -> Result<()> {
    let hash = endpoint.map(relay_types::endpoint_hash);
    let dead = core.dead_letters().list_dead(hash.as_deref())?;
    for dl in dead {
        println!(
            "{}\t{}\t{}\t{}",
            dl.envelope.id,
            dl.envelope.subject,
            dl.envelope.from,
            dl.reason_text(),
        );
    }
    Ok(())
}

fn dlq_purge(core: &RelayCore, max_age_ms: i64, endpoint: Option<&str>) -> Result<()> {
    let hash = endpoint.map(relay_types::endpoint_hash);
    let purged = core.dead_letters().purge(max_age_ms, hash.as_deref(), chrono::Utc::now())?;
    println!("purged {purged} dead letter(s)");
    Ok(())
}

fn rules_list(core: &RelayCore) {
    for rule in core.list_access_rules() {
        println!("{}\t{}\t{:?}\t{}", rule.from, rule.to, rule.action, rule.priority);
    }
}

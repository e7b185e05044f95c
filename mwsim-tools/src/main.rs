use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mwsim_intents::{
    classify, is_valid_id, Classification, EngineConfig, IntentKind, LinkEnvironment,
    PaymentIntent, PendingEntry, PendingIntentStore, TransferTokenIntent, TriggerSource,
};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "mwsim-tools",
    about = "Utility commands for mwsim payment and transfer intents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a trigger string the way the wallet would.
    Classify(ClassifyArgs),
    /// Print the share links for an intent id.
    Link(LinkArgs),
    /// Inspect or edit the durable pending-intent store.
    Pending {
        #[command(subcommand)]
        command: PendingCommand,
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Payment,
    TransferToken,
}

impl From<KindArg> for IntentKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Payment => IntentKind::Payment,
            KindArg::TransferToken => IntentKind::TransferToken,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    DeepLink,
    Scan,
    Notification,
}

impl From<SourceArg> for TriggerSource {
    fn from(source: SourceArg) -> Self {
        match source {
            SourceArg::DeepLink => TriggerSource::DeepLink,
            SourceArg::Scan => TriggerSource::Scan,
            SourceArg::Notification => TriggerSource::Notification,
        }
    }
}

#[derive(Args)]
struct ClassifyArgs {
    /// Raw URL or QR payload.
    input: String,
    /// Where the input came from. Bare ids are only accepted from a scan.
    #[arg(long, value_enum, default_value_t = SourceArg::Scan)]
    source: SourceArg,
}

#[derive(Args)]
struct LinkArgs {
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long)]
    id: String,
    /// Use the development hosts.
    #[arg(long)]
    dev: bool,
    /// Browser to return to after a payment approval.
    #[arg(long)]
    source_browser: Option<String>,
}

#[derive(Args)]
struct StoreArgs {
    /// Overrides MWSIM_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum PendingCommand {
    /// Print every pending entry.
    Show,
    /// Queue an intent as if its trigger arrived while signed out.
    Save {
        #[arg(long, value_enum)]
        kind: KindArg,
        #[arg(long)]
        id: String,
        #[arg(long)]
        source_browser: Option<String>,
    },
    /// Remove pending entries, all kinds unless one is given.
    Clear {
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mwsim_tools=info,mwsim_intents=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Classify(args) => classify_input(args),
        Commands::Link(args) => print_links(args),
        Commands::Pending { command, store } => pending(command, store),
    }
}

fn classify_input(args: ClassifyArgs) -> Result<()> {
    let classification = classify(&args.input, args.source.into());
    output_json(&classification)?;
    if matches!(classification, Classification::Unrecognized) {
        bail!("input is not a recognized payment or transfer trigger");
    }
    Ok(())
}

#[derive(Serialize)]
struct LinkSummary {
    kind: IntentKind,
    id: String,
    universal_link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_link: Option<String>,
}

fn print_links(args: LinkArgs) -> Result<()> {
    if !is_valid_id(&args.id) {
        bail!("id {:?} must match [a-zA-Z0-9_-]+", args.id);
    }
    let env = if args.dev {
        LinkEnvironment::Development
    } else {
        LinkEnvironment::Production
    };

    let summary = match args.kind {
        KindArg::Payment => {
            let mut intent = PaymentIntent::new(args.id.clone());
            if let Some(browser) = args.source_browser {
                intent = intent.with_source_browser(browser);
            }
            LinkSummary {
                kind: IntentKind::Payment,
                id: args.id,
                universal_link: intent.universal_link(env),
                app_link: Some(intent.app_link()),
            }
        }
        KindArg::TransferToken => {
            if args.source_browser.is_some() {
                bail!("--source-browser only applies to payment links");
            }
            LinkSummary {
                kind: IntentKind::TransferToken,
                universal_link: TransferTokenIntent::new(args.id.clone()).universal_link(env),
                id: args.id,
                app_link: None,
            }
        }
    };
    output_json(&summary)
}

fn open_store(args: &StoreArgs) -> Result<PendingIntentStore> {
    let mut config = EngineConfig::from_env().context("failed to read MWSIM_* environment")?;
    if let Some(ref dir) = args.data_dir {
        config.data_dir = dir.clone();
    }
    let path = config.pending_db_path();
    tracing::debug!(path = %path.display(), "opening pending-intent store");
    PendingIntentStore::persistent(&path)
        .with_context(|| format!("failed to open pending store at {}", path.display()))
}

fn pending(command: PendingCommand, args: StoreArgs) -> Result<()> {
    let store = open_store(&args)?;
    match command {
        PendingCommand::Show => {
            let mut entries = Vec::new();
            for kind in IntentKind::ALL {
                if let Some(entry) = store.load(kind)? {
                    entries.push(entry);
                }
            }
            output_json(&entries)
        }
        PendingCommand::Save {
            kind,
            id,
            source_browser,
        } => {
            if !is_valid_id(&id) {
                bail!("id {id:?} must match [a-zA-Z0-9_-]+");
            }
            let entry = match kind {
                KindArg::Payment => PendingEntry::payment(id, source_browser),
                KindArg::TransferToken => {
                    if source_browser.is_some() {
                        bail!("--source-browser only applies to payments");
                    }
                    PendingEntry::transfer_token(id)
                }
            };
            store.save(&entry)?;
            tracing::info!(kind = %entry.kind, id = %entry.id, "pending intent saved");
            output_json(&entry)
        }
        PendingCommand::Clear { kind } => {
            let kinds = match kind {
                Some(kind) => vec![IntentKind::from(kind)],
                None => IntentKind::ALL.to_vec(),
            };
            for kind in &kinds {
                store.clear(*kind)?;
                tracing::info!(%kind, "pending intent cleared");
            }
            output_json(&kinds)
        }
    }
}

fn output_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use retrace_common::{AuthorId, EntityId, EntityKey, EntityType, Value, Version};
use retrace_kernel::{EntityTypeConfig, HistoryStore, TrackedEntity, TrackingConfig, TrackingRegistry};
use retrace_persist::{HistoryArchive, MemoryStore, SqliteStore};
use retrace_timeline::{
    CaptureMode, NavigationReport, Navigator, Recorder, load_entity, retry_on_conflict,
};
use retrace_tools::HistoryInspector;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONFLICT_ATTEMPTS: usize = 3;

#[derive(Parser)]
#[command(name = "retrace-cli", about = "Record, inspect and navigate entity histories")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// SQLite database holding entities and their histories
    #[arg(long, default_value = "retrace.db")]
    db: PathBuf,

    /// YAML tracking configuration. Without one, the entity's type is
    /// tracked in full with a version pointer.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Identity recorded as the author of new versions
    #[arg(long)]
    author: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the draft / active / archived walkthrough in memory
    Demo,
    /// Assign attributes (`name=value`, value parsed as JSON or taken as text)
    Set {
        /// Entity as `type#id`
        #[arg(value_parser = parse_entity)]
        entity: EntityKey,
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// Delete an entity, recording its final state
    Delete {
        #[arg(value_parser = parse_entity)]
        entity: EntityKey,
    },
    /// Print the summary and audit log of an entity
    History {
        #[arg(value_parser = parse_entity)]
        entity: EntityKey,
    },
    /// Move an entity to an exact version
    Goto {
        #[arg(value_parser = parse_entity)]
        entity: EntityKey,
        version: Version,
    },
    /// Move an entity back
    Rewind {
        #[arg(value_parser = parse_entity)]
        entity: EntityKey,
        #[arg(short, long, default_value = "1")]
        steps: u64,
    },
    /// Move an entity forward
    Forward {
        #[arg(value_parser = parse_entity)]
        entity: EntityKey,
        #[arg(short, long, default_value = "1")]
        steps: u64,
    },
    /// Export an entity's audit log to an archive
    Export {
        #[arg(value_parser = parse_entity)]
        entity: EntityKey,
        #[arg(short, long, default_value = "archive")]
        archive: PathBuf,
    },
    /// Verify the integrity chain of an archive
    Verify {
        #[arg(short, long, default_value = "archive")]
        archive: PathBuf,
    },
}

impl Commands {
    fn entity(&self) -> Option<&EntityKey> {
        match self {
            Self::Set { entity, .. }
            | Self::Delete { entity }
            | Self::History { entity }
            | Self::Goto { entity, .. }
            | Self::Rewind { entity, .. }
            | Self::Forward { entity, .. }
            | Self::Export { entity, .. } => Some(entity),
            Self::Demo | Self::Verify { .. } => None,
        }
    }
}

fn parse_entity(s: &str) -> Result<EntityKey, String> {
    match s.split_once('#') {
        Some((entity_type, id)) if !entity_type.is_empty() && !id.is_empty() => {
            Ok(EntityKey::new(entity_type, id))
        }
        _ => Err(format!("expected `type#id`, got `{s}`")),
    }
}

fn parse_assignment(s: &str) -> anyhow::Result<(String, Value)> {
    let Some((name, raw)) = s.split_once('=') else {
        bail!("expected `name=value`, got `{s}`");
    };
    if name.is_empty() {
        bail!("attribute name missing in `{s}`");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match &cli.command {
        Commands::Demo => return demo(),
        Commands::Verify { archive } => {
            let archive = HistoryArchive::open(archive)?;
            archive.verify_integrity()?;
            println!(
                "Archive OK: {} segment(s) at {}",
                archive.manifest().entries.len(),
                archive.root().display()
            );
            return Ok(());
        }
        _ => {}
    }

    let registry = Arc::new(load_registry(&cli)?);
    let mut store = SqliteStore::open(&cli.db, &registry.author().field)
        .with_context(|| format!("opening {}", cli.db.display()))?;
    let mut recorder = Recorder::new(registry.clone());
    if let Some(author) = cli.author.clone() {
        recorder = recorder.with_author_resolver(move || Some(AuthorId::new(author.clone())));
    }
    let navigator = Navigator::new(registry);

    match cli.command {
        Commands::Set {
            entity,
            assignments,
        } => {
            let assignments = assignments
                .iter()
                .map(|s| parse_assignment(s))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let record = retry_on_conflict(CONFLICT_ATTEMPTS, || {
                let mut tracked = load_entity(&mut store, entity.clone())?;
                for (name, value) in &assignments {
                    tracked.set(name.clone(), value.clone());
                }
                recorder.save(&mut store, &mut tracked, CaptureMode::Enabled)
            })?;
            match record {
                Some(record) => println!("{entity}: recorded v{}", record.version),
                None => println!("{entity}: no tracked change"),
            }
        }
        Commands::Delete { entity } => {
            let record = retry_on_conflict(CONFLICT_ATTEMPTS, || {
                let mut tracked = load_entity(&mut store, entity.clone())?;
                recorder.destroy(&mut store, &mut tracked, CaptureMode::Enabled)
            })?;
            match record {
                Some(record) => println!("{entity}: destroyed at v{}", record.version),
                None => println!("{entity}: not stored"),
            }
        }
        Commands::History { entity } => {
            let tracked = load_entity(&mut store, entity.clone())?;
            let records = navigator.versions(&mut store, &entity)?;
            let current = navigator.current_version(&mut store, &tracked)?;
            println!("{}", HistoryInspector::summary(&entity, &records, current));
            for record in &records {
                println!("  {}", HistoryInspector::describe(record));
            }
        }
        Commands::Goto { entity, version } => {
            let mut tracked = load_entity(&mut store, entity)?;
            let report = navigator.go_to(&mut store, &mut tracked, version)?;
            print_navigation(&report, &tracked);
        }
        Commands::Rewind { entity, steps } => {
            let mut tracked = load_entity(&mut store, entity)?;
            let report = navigator.rewind(&mut store, &mut tracked, steps)?;
            print_navigation(&report, &tracked);
        }
        Commands::Forward { entity, steps } => {
            let mut tracked = load_entity(&mut store, entity)?;
            let report = navigator.fast_forward(&mut store, &mut tracked, steps)?;
            print_navigation(&report, &tracked);
        }
        Commands::Export { entity, archive } => {
            let records = navigator.versions(&mut store, &entity)?;
            if records.is_empty() {
                bail!("{entity} has no history to export");
            }
            let mut archive = HistoryArchive::open(&archive)?;
            let filename = archive.export(&entity, &records)?;
            println!("{entity}: {} version(s) exported to {filename}", records.len());
        }
        Commands::Demo | Commands::Verify { .. } => {}
    }

    Ok(())
}

fn load_registry(cli: &Cli) -> anyhow::Result<TrackingRegistry> {
    let config = match &cli.config {
        Some(path) => TrackingConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = TrackingConfig {
                record_author: cli.author.is_some(),
                ..Default::default()
            };
            if let Some(entity) = cli.command.entity() {
                config = config.track(
                    entity.entity_type.as_str(),
                    EntityTypeConfig {
                        track_all: true,
                        version_pointer: true,
                        ..Default::default()
                    },
                );
            }
            config
        }
    };
    Ok(config.resolve()?)
}

fn print_navigation(report: &NavigationReport, entity: &TrackedEntity) {
    println!(
        "{}: v{} -> v{} via {} (applied {:?})",
        report.entity, report.from, report.to, report.approach, report.applied
    );
    if !report.is_exact() {
        println!("  warning: skipped missing versions {:?}", report.skipped);
    }
    match serde_json::to_string(entity.attributes()) {
        Ok(json) => println!("  {json}"),
        Err(err) => println!("  <unprintable attributes: {err}>"),
    }
}

fn demo() -> anyhow::Result<()> {
    println!("Demo: article history in memory");

    let registry = Arc::new(
        TrackingConfig::default()
            .track(
                "article",
                EntityTypeConfig {
                    only: Some(vec!["status".into()]),
                    version_pointer: true,
                    ..Default::default()
                },
            )
            .resolve()?,
    );
    let recorder = Recorder::new(registry.clone());
    let navigator = Navigator::new(registry);
    let mut store = MemoryStore::new();

    let key = EntityKey {
        entity_type: EntityType::new("article"),
        entity_id: EntityId::generate(),
    };
    println!("entity {key}");
    let mut article = TrackedEntity::new(key);
    for status in ["draft", "active", "archived"] {
        article.set("status", status);
        recorder.save(&mut store, &mut article, CaptureMode::Enabled)?;
    }
    show(&navigator, &mut store, &article, "after three saves")?;

    navigator.rewind(&mut store, &mut article, 1)?;
    show(&navigator, &mut store, &article, "rewind(1)")?;
    navigator.go_to(&mut store, &mut article, 1)?;
    show(&navigator, &mut store, &article, "go_to(1)")?;
    navigator.fast_forward(&mut store, &mut article, 2)?;
    show(&navigator, &mut store, &article, "fast_forward(2)")?;

    let records = navigator.versions(&mut store, article.key())?;
    for record in &records {
        println!("  {}", HistoryInspector::describe(record));
    }
    info!(commits = store.commit_count(), "demo finished");
    Ok(())
}

fn show<S: HistoryStore>(
    navigator: &Navigator,
    store: &mut S,
    article: &TrackedEntity,
    label: &str,
) -> anyhow::Result<()> {
    let current = navigator.current_version(store, article)?;
    let status = article.get("status").cloned().unwrap_or(Value::Null);
    println!("{label:<16} status={status} current=v{current}");
    Ok(())
}

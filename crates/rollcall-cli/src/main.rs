use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rollcall_core::{
    resolver::DEFAULT_TOLERANCE, CandidateResolver, Embedding, EncodingStore, MatchRule,
    ReadError, ReaderGuard, Shutdown, TokenReader,
};
use rollcall_hw::{SerialTokenReader, MAX_TEXT_LEN};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance operator utility")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read or enroll RFID tags
    Token {
        #[command(flatten)]
        reader: ReaderArgs,
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Inspect the reference encodings artifact
    Store {
        /// Path to the encodings JSON file
        #[arg(short, long)]
        encodings: PathBuf,
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Args)]
struct ReaderArgs {
    /// Reader bridge character device
    #[arg(long, default_value = "/dev/ttyACM0")]
    device: String,
    #[arg(long, default_value_t = 9600)]
    baud: u32,
    /// Seconds to wait for a tag; 0 waits forever
    #[arg(long, default_value_t = 0)]
    timeout: u64,
}

impl ReaderArgs {
    fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

#[derive(Subcommand)]
enum TokenAction {
    /// Print the id and text of the next presented tag
    Read {
        /// Keep reading until interrupted
        #[arg(short, long)]
        follow: bool,
    },
    /// Store a label on the next presented tag, then read it back
    Write {
        /// Text to store; must equal the identity label
        text: String,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// List identities and their reference counts
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Resolve a probe vector against the store
    Resolve {
        /// Comma-separated feature values
        #[arg(allow_hyphen_values = true)]
        vector: String,
        /// `euclidean` or `cosine`
        #[arg(long, default_value = "euclidean")]
        metric: String,
        #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
        threshold: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Token { reader, action } => match action {
            TokenAction::Read { follow } => read_tags(reader, follow).await?,
            TokenAction::Write { text } => write_tag(reader, text).await?,
        },
        Commands::Store { encodings, action } => {
            let store = EncodingStore::load(&encodings)
                .with_context(|| format!("cannot load {}", encodings.display()))?;
            match action {
                StoreAction::List { json } => list_store(&store, json)?,
                StoreAction::Resolve {
                    vector,
                    metric,
                    threshold,
                } => resolve_probe(store, &vector, &metric, threshold)?,
            }
        }
    }

    Ok(())
}

async fn read_tags(args: ReaderArgs, follow: bool) -> Result<()> {
    let shutdown = Shutdown::new();
    let timeout = args.timeout();
    let mut reader = SerialTokenReader::new(args.device, args.baud, shutdown.clone());

    if follow {
        println!("Reading tags from {} (ctrl-c to stop)...", reader.device_path());
    } else {
        println!("Hold a tag near the reader...");
    }

    let mut worker = tokio::task::spawn_blocking(move || -> Result<()> {
        loop {
            let result = {
                let mut guard = ReaderGuard::new(&mut reader);
                guard.read(timeout)
            };
            match result {
                Ok(tag) => println!("{}\t{}", tag.id, tag.text.trim()),
                Err(ReadError::Cancelled) => return Ok(()),
                Err(ReadError::Timeout(_)) if follow => continue,
                Err(e) if follow => tracing::warn!(error = %e, "tag read failed"),
                Err(e) => return Err(e.into()),
            }
            if !follow {
                return Ok(());
            }
        }
    });

    tokio::select! {
        joined = &mut worker => joined?,
        _ = tokio::signal::ctrl_c() => {
            shutdown.trigger();
            worker.await?
        }
    }
}

async fn write_tag(args: ReaderArgs, text: String) -> Result<()> {
    check_tag_text(&text)?;

    let shutdown = Shutdown::new();
    let timeout = args.timeout();
    let mut reader = SerialTokenReader::new(args.device, args.baud, shutdown.clone());

    println!("Hold the tag to enroll near the reader...");
    let mut worker = tokio::task::spawn_blocking(move || -> Result<()> {
        let id = {
            let mut guard = ReaderGuard::new(&mut reader);
            guard.write(&text, timeout)?
        };
        println!("Wrote {text:?} to tag {id}");

        println!("Hold the tag near the reader again to confirm...");
        let tag = {
            let mut guard = ReaderGuard::new(&mut reader);
            guard.read(timeout)?
        };
        if tag.id != id {
            bail!("read back tag {} but wrote tag {id}", tag.id);
        }
        if !tag.matches(&text) {
            bail!("tag {id} reads back {:?}, expected {text:?}", tag.text.trim());
        }
        println!("Tag {id} verified");
        Ok(())
    });

    tokio::select! {
        joined = &mut worker => joined?,
        _ = tokio::signal::ctrl_c() => {
            shutdown.trigger();
            worker.await?
        }
    }
}

/// Reject text that could never equal a label once the tag is read back.
fn check_tag_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        bail!("tag text must not be empty");
    }
    if text.trim() != text {
        bail!("tag text {text:?} has leading or trailing whitespace");
    }
    if text.len() > MAX_TEXT_LEN {
        bail!("tag text is {} bytes; the tag holds at most {MAX_TEXT_LEN}", text.len());
    }
    Ok(())
}

fn list_store(store: &EncodingStore, json: bool) -> Result<()> {
    let labels = store.labels();
    if json {
        let identities: Vec<_> = labels
            .iter()
            .map(|(label, count)| serde_json::json!({ "label": label, "references": count }))
            .collect();
        let summary = serde_json::json!({
            "dimension": store.dimension(),
            "references": store.len(),
            "identities": identities,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "{} references, {} identities, dimension {}",
        store.len(),
        store.identity_count(),
        store.dimension()
    );
    for (label, count) in labels {
        println!("  {label:<24} {count}");
    }
    Ok(())
}

fn resolve_probe(store: EncodingStore, vector: &str, metric: &str, threshold: f32) -> Result<()> {
    let probe = parse_vector(vector)?;
    if probe.dimension() != store.dimension() {
        bail!(
            "probe has {} values but the store holds {}-dimensional encodings",
            probe.dimension(),
            store.dimension()
        );
    }
    let rule = MatchRule::from_metric(metric, threshold).map_err(|e| anyhow!(e))?;
    let resolver = CandidateResolver::new(Arc::new(store), rule);

    let tally = resolver.tally(&probe);
    for (label, votes) in tally.entries() {
        println!("  {label:<24} {votes}");
    }
    println!("{}", resolver.resolve_embedding(&probe));
    Ok(())
}

fn parse_vector(raw: &str) -> Result<Embedding> {
    let values = raw
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<f32>()
                .with_context(|| format!("invalid feature value {v:?}"))
        })
        .collect::<Result<Vec<_>>>()?;
    if values.is_empty() {
        bail!("probe vector is empty");
    }
    Ok(Embedding::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vector() {
        let probe = parse_vector("0.1, -0.25,0.5,").unwrap();
        assert_eq!(probe.values, vec![0.1, -0.25, 0.5]);
    }

    #[test]
    fn test_parse_vector_rejects_garbage() {
        assert!(parse_vector("0.1,abc").is_err());
        assert!(parse_vector(" , ").is_err());
    }

    #[test]
    fn test_tag_text_checks() {
        check_tag_text("Alice").unwrap();
        assert!(check_tag_text(" Alice").is_err());
        assert!(check_tag_text("Alice\t").is_err());
        assert!(check_tag_text("   ").is_err());
        assert!(check_tag_text(&"x".repeat(MAX_TEXT_LEN + 1)).is_err());
    }

    #[test]
    fn test_cli_parses_token_write() {
        let cli = Cli::try_parse_from(["rollcall", "token", "--device", "/dev/ttyUSB0", "write", "Alice"])
            .unwrap();
        match cli.command {
            Commands::Token {
                reader,
                action: TokenAction::Write { text },
            } => {
                assert_eq!(reader.device, "/dev/ttyUSB0");
                assert_eq!(reader.timeout(), None);
                assert_eq!(text, "Alice");
            }
            _ => panic!("expected token write"),
        }
    }

    #[test]
    fn test_cli_parses_negative_probe() {
        let cli = Cli::try_parse_from([
            "rollcall", "store", "-e", "enc.json", "resolve", "-0.5,0.25", "--metric", "cosine",
        ])
        .unwrap();
        match cli.command {
            Commands::Store {
                action: StoreAction::Resolve { vector, metric, .. },
                ..
            } => {
                assert_eq!(vector, "-0.5,0.25");
                assert_eq!(metric, "cosine");
            }
            _ => panic!("expected store resolve"),
        }
    }
}

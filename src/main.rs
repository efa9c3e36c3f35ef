use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nsrl_index::config::Config;
use nsrl_index::query::{HashQuery, Lookup, QueryOutcome};
use nsrl_index::{IndexBuilder, RecordOrder};

#[derive(Parser)]
#[command(name = "nsrl-index")]
#[command(about = "Sorted on-disk index over the NSRL hash catalog (SHA-1 / MD5)", long_about = None)]
struct Cli {
    /// Config file (default: <dataset>/nsrl-index.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build sha1.index and md5.index from the catalog
    Init {
        /// Dataset directory containing NSRLFile.txt
        #[arg(short = 'n', long = "nsrl")]
        dataset: PathBuf,

        /// Records per in-memory sorted chunk
        #[arg(long)]
        chunk_capacity: Option<usize>,

        /// Order duplicates by key only (offset ties keep input order)
        #[arg(long)]
        key_only_order: bool,

        /// Keep raw/chunk/merged working files for debugging
        #[arg(long)]
        keep_intermediates: bool,
    },

    /// Look up one digest or a file of digests
    #[command(group(ArgGroup::new("input").required(true).args(["hash", "hashfile"])))]
    Query {
        #[arg(short = 'n', long = "nsrl")]
        dataset: PathBuf,

        /// Hex digest (40 chars for SHA-1, 32 for MD5)
        #[arg(long)]
        hash: Option<String>,

        /// File with one hex digest per line
        #[arg(long)]
        hashfile: Option<PathBuf>,

        /// Emit one JSON object per digest
        #[arg(long)]
        json: bool,

        /// Memory-map the index files
        #[arg(long)]
        mmap: bool,
    },

    /// Re-verify that both index files are sorted and complete
    Check {
        #[arg(short = 'n', long = "nsrl")]
        dataset: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init {
            dataset,
            chunk_capacity,
            key_only_order,
            keep_intermediates,
        } => {
            let mut config = load_config(cli.config.as_deref(), &dataset)?;
            if let Some(c) = chunk_capacity {
                config.build.chunk_capacity = c;
            }
            if key_only_order {
                config.build.record_order = RecordOrder::KeyOnly;
            }
            config.build.keep_intermediates |= keep_intermediates;
            config.validate()?;

            info!("Initializing index under {}", dataset.display());
            let report = IndexBuilder::new(&dataset, config.build)
                .run()
                .context("index build failed")?;
            print!("{}", report);
        }
        Commands::Query {
            dataset,
            hash,
            hashfile,
            json,
            mmap,
        } => {
            let mut config = load_config(cli.config.as_deref(), &dataset)?;
            config.query.use_mmap |= mmap;
            config.query.json |= json;

            info!("Performing search...");
            let query = HashQuery::open(&dataset, &config)
                .with_context(|| format!("failed to open index under {}", dataset.display()))?;
            let outcomes = match (hash, hashfile) {
                (Some(h), _) => vec![query.lookup(&h)?],
                (None, Some(f)) => {
                    let file = std::fs::File::open(&f)
                        .with_context(|| format!("failed to open {}", f.display()))?;
                    let lines = BufReader::new(file)
                        .lines()
                        .collect::<std::io::Result<Vec<_>>>()
                        .with_context(|| format!("failed to read {}", f.display()))?;
                    query.lookup_batch(lines)
                }
                (None, None) => bail!("Hash or hashfile is required for this command"),
            };

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for outcome in &outcomes {
                report_outcome(&mut out, outcome, config.query.json)?;
            }
        }
        Commands::Check { dataset } => {
            let config = load_config(cli.config.as_deref(), &dataset)?;
            let query = HashQuery::open(&dataset, &config)
                .with_context(|| format!("failed to open index under {}", dataset.display()))?;
            if let Some(m) = query.manifest() {
                println!(
                    "built from {} catalog rows (chunk capacity {}, {:?} order)",
                    m.rows, m.chunk_capacity, m.record_order
                );
            }
            let mut failed = false;
            for c in query.check()? {
                match (c.sort.first_violation, c.expected_records) {
                    (Some(at), _) => {
                        println!("{}: NOT SORTED (first violation at record {})", c.space, at);
                    }
                    (None, Some(n)) if n != c.sort.records => {
                        println!(
                            "{}: record count {} differs from manifest ({})",
                            c.space, c.sort.records, n
                        );
                    }
                    _ => println!("{}: ok ({} records)", c.space, c.sort.records),
                }
                failed |= !c.is_ok();
            }
            if query.catalog_changed() {
                println!("catalog changed since build: re-run init");
            }
            if failed {
                bail!("index check failed");
            }
        }
    }

    Ok(())
}

fn load_config(explicit: Option<&Path>, dataset: &Path) -> Result<Config> {
    Config::discover(explicit, dataset).context("failed to load configuration")
}

fn report_outcome<W: Write>(out: &mut W, outcome: &QueryOutcome, json: bool) -> Result<()> {
    if json {
        let value = match &outcome.lookup {
            Lookup::Miss => serde_json::json!({ "digest": outcome.digest, "status": "miss" }),
            Lookup::Invalid(reason) => {
                serde_json::json!({ "digest": outcome.digest, "status": "invalid", "error": reason })
            }
            Lookup::Failed(reason) => {
                serde_json::json!({ "digest": outcome.digest, "status": "error", "error": reason })
            }
            Lookup::Hits(hits) => {
                let records: Vec<serde_json::Value> = hits
                    .iter()
                    .map(|h| match h {
                        Ok(sr) => serde_json::json!({ "status": "ok", "record": sr }),
                        Err(e) => serde_json::json!({
                            "status": if e.is_stale() { "stale" } else { "error" },
                            "error": e.to_string(),
                        }),
                    })
                    .collect();
                serde_json::json!({ "digest": outcome.digest, "status": "hit", "records": records })
            }
        };
        writeln!(out, "{}", serde_json::to_string(&value)?)?;
        return Ok(());
    }

    match &outcome.lookup {
        Lookup::Miss => writeln!(out, "{} not found.", outcome.digest)?,
        Lookup::Invalid(reason) => writeln!(out, "{} invalid: {}", outcome.digest, reason)?,
        Lookup::Failed(reason) => writeln!(out, "{} lookup failed: {}", outcome.digest, reason)?,
        Lookup::Hits(hits) => {
            for hit in hits {
                match hit {
                    Ok(sr) => writeln!(out, "{}", sr)?,
                    Err(e) => writeln!(out, "{} {}", outcome.digest, e)?,
                }
            }
        }
    }
    Ok(())
}

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use facedex::config::Config;
use facedex::db::IdentityStore;
use facedex::export;
use facedex::faces::{reference_embedding, FaceDetector, OnnxFaceDetector, QuickFinder};
use facedex::indexer::IndexerOptions;
use facedex::logging;
use facedex::scanner::find_images;
use facedex::tasks::{BackgroundTaskManager, CancelToken};

enum Command {
    Index { root: PathBuf },
    Find { reference: PathBuf, root: PathBuf, json: bool, export_to: Option<PathBuf> },
    Store(StoreCommand),
}

/// Commands that only read or curate the identity store.
enum StoreCommand {
    People,
    Rename { cluster_id: i64, label: String },
    Merge { keep: i64, merged: Vec<i64> },
    Suggest { threshold: Option<f32>, top_k: Option<usize> },
    Faces { cluster_id: i64 },
    Recent { limit: usize },
    Export { cluster_id: i64, out_dir: PathBuf },
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut rest = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facedex {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let path = args.get(i + 1).context("--config requires a path argument")?;
                config_path = Some(PathBuf::from(path));
                i += 1;
            }
            _ => rest.push(args[i].clone()),
        }
        i += 1;
    }

    let Some((name, params)) = rest.split_first() else {
        print_help();
        std::process::exit(1);
    };

    let command = match name.as_str() {
        "index" => Command::Index {
            root: PathBuf::from(positional(params, 0, "DIR")?),
        },
        "people" => Command::Store(StoreCommand::People),
        "rename" => Command::Store(StoreCommand::Rename {
            cluster_id: parse_id(positional(params, 0, "CLUSTER")?)?,
            label: params[1..].join(" "),
        }),
        "merge" => {
            let keep = parse_id(positional(params, 0, "KEEP")?)?;
            let merged = params[1..].iter().map(|s| parse_id(s)).collect::<Result<Vec<_>>>()?;
            Command::Store(StoreCommand::Merge { keep, merged })
        }
        "suggest" => {
            let mut threshold = None;
            let mut top_k = None;
            let mut j = 0;
            while j < params.len() {
                match params[j].as_str() {
                    "--threshold" => {
                        threshold = Some(positional(params, j + 1, "THRESHOLD")?.parse()?);
                        j += 1;
                    }
                    "--top" => {
                        top_k = Some(positional(params, j + 1, "N")?.parse()?);
                        j += 1;
                    }
                    other => bail!("Unknown option for suggest: {}", other),
                }
                j += 1;
            }
            Command::Store(StoreCommand::Suggest { threshold, top_k })
        }
        "faces" => Command::Store(StoreCommand::Faces {
            cluster_id: parse_id(positional(params, 0, "CLUSTER")?)?,
        }),
        "recent" => Command::Store(StoreCommand::Recent {
            limit: match params.first() {
                Some(n) => n.parse().with_context(|| format!("Invalid limit: {}", n))?,
                None => 20,
            },
        }),
        "export" => Command::Store(StoreCommand::Export {
            cluster_id: parse_id(positional(params, 0, "CLUSTER")?)?,
            out_dir: PathBuf::from(positional(params, 1, "OUT_DIR")?),
        }),
        "find" => {
            let mut json = false;
            let mut export_to = None;
            let mut paths = Vec::new();
            let mut j = 0;
            while j < params.len() {
                match params[j].as_str() {
                    "--json" => json = true,
                    "--export" => {
                        export_to = Some(PathBuf::from(positional(params, j + 1, "OUT_DIR")?));
                        j += 1;
                    }
                    other => paths.push(PathBuf::from(other)),
                }
                j += 1;
            }
            let [reference, root] = <[PathBuf; 2]>::try_from(paths)
                .map_err(|_| anyhow::anyhow!("find expects REFERENCE_IMAGE and DIR"))?;
            Command::Find {
                reference,
                root,
                json,
                export_to,
            }
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    Ok(Args { config_path, command })
}

fn positional<'a>(params: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    params
        .get(index)
        .map(String::as_str)
        .with_context(|| format!("Missing argument: {}", name))
}

fn parse_id(s: &str) -> Result<i64> {
    s.parse().with_context(|| format!("Invalid id: {}", s))
}

fn print_help() {
    println!(
        r#"facedex - group the people in a photo library

USAGE:
    facedex [OPTIONS] <COMMAND>

COMMANDS:
    index DIR                       Detect faces under DIR and regroup people
    people                          List people with their photo counts
    rename CLUSTER LABEL            Rename a person
    merge KEEP CLUSTER...           Merge people into KEEP
    suggest [--threshold T] [--top N]
                                    Show pairs of people that look alike
    faces CLUSTER                   List the faces of one person
    recent [N]                      List the N most recently indexed faces
    export CLUSTER OUT_DIR          Copy a person's photos into OUT_DIR
    find IMAGE DIR [--json] [--export OUT_DIR]
                                    Find the person in IMAGE among DIR's photos

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACEDEX_CONFIG      Path to config file (overrides default location)
    FACEDEX_LOG         Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/facedex/config.toml

Re-indexing regroups every face, so renames and merges are not kept."#
    );
}

fn main() -> Result<()> {
    let args = parse_args()?;

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match args.command {
        Command::Index { root } => run_index(&config, root),
        Command::Find {
            reference,
            root,
            json,
            export_to,
        } => run_find(&config, &reference, &root, json, export_to.as_deref()),
        Command::Store(command) => {
            let store = open_store(&config)?;
            run_store_command(&config, &store, command)
        }
    }
}

fn open_store(config: &Config) -> Result<IdentityStore> {
    IdentityStore::open(&config.db_path).with_context(|| format!("Failed to open database {:?}", config.db_path))
}

fn run_index(config: &Config, root: PathBuf) -> Result<()> {
    let store = Arc::new(open_store(config)?);
    let detector: Arc<dyn FaceDetector> = Arc::new(OnnxFaceDetector::new(&config.detector)?);
    let mut manager = BackgroundTaskManager::new();

    let id = manager.spawn_indexing(store, detector, root, IndexerOptions::from_config(config))?;

    let mut last_reported = None;
    loop {
        if let Some(done) = manager.poll_updates().into_iter().next() {
            if done.success {
                println!("{} (took {:.1?})", done.message, done.elapsed);
                return Ok(());
            }
            bail!("{} did not finish: {}", done.task_type.display_name(), done.message);
        }

        if let Some(progress) = manager.progress(id) {
            if last_reported != Some(progress.current) {
                last_reported = Some(progress.current);
                eprintln!(
                    "[{:>3}%] {}/{} {}",
                    progress.percent(),
                    progress.current,
                    progress.total,
                    progress.message.as_deref().unwrap_or("")
                );
            }
        }

        std::thread::sleep(Duration::from_millis(200));
    }
}

fn run_find(config: &Config, reference: &Path, root: &Path, json: bool, export_to: Option<&Path>) -> Result<()> {
    let detector = OnnxFaceDetector::new(&config.detector)?;
    let reference_emb = reference_embedding(&detector, reference)?;
    let candidates = find_images(root, &config.scanner.image_extensions)?;

    let finder = QuickFinder::new(&detector, &config.search.thresholds)?
        .with_progress_stride(config.indexer.progress_stride);
    let matches = finder.scan(&reference_emb, &candidates, &CancelToken::new(), |p| {
        eprintln!("[{:>3}%] {}", p.percent(), p.message.as_deref().unwrap_or(""));
    });

    if json {
        println!("{}", serde_json::to_string_pretty(&matches)?);
    } else {
        for m in &matches {
            println!("{:.3}  tier {}  {}", m.similarity, m.tier, m.path.display());
        }
        println!("{} matches in {} images", matches.len(), candidates.len());
    }

    if let Some(out_root) = export_to {
        let (dir, copied) = export::export_matches(&matches, out_root)?;
        eprintln!("Copied {} images to {}", copied, dir.display());
    }

    Ok(())
}

fn run_store_command(config: &Config, store: &IdentityStore, command: StoreCommand) -> Result<()> {
    match command {
        StoreCommand::People => {
            let clusters = store.list_clusters()?;
            for c in &clusters {
                println!("{:>5}  {:>5}  {}", c.id, c.photo_count, c.label);
            }
            println!("{} people", clusters.len());
        }
        StoreCommand::Rename { cluster_id, label } => {
            if label.trim().is_empty() {
                bail!("Label must not be empty");
            }
            store.rename_cluster(cluster_id, label.trim())?;
            println!("Renamed {} to {}", cluster_id, label.trim());
        }
        StoreCommand::Merge { keep, merged } => {
            let moved = store.merge_clusters(keep, &merged)?;
            println!("Merged {} people into {} ({} faces moved)", merged.len(), keep, moved);
        }
        StoreCommand::Suggest { threshold, top_k } => {
            let suggestions = store.suggest_merges(
                threshold.unwrap_or(config.suggestions.threshold),
                top_k.unwrap_or(config.suggestions.top_k),
            )?;
            for s in &suggestions {
                println!("{:>5} + {:<5} similarity {:.3}", s.first, s.second, s.similarity);
            }
            println!("{} suggestions", suggestions.len());
        }
        StoreCommand::Faces { cluster_id } => {
            let faces = store.get_faces_by_cluster(cluster_id)?;
            print_faces(&faces);
        }
        StoreCommand::Recent { limit } => {
            let faces = store.get_recent_faces(limit)?;
            print_faces(&faces);
        }
        StoreCommand::Export { cluster_id, out_dir } => {
            let copied = store.export_cluster(cluster_id, &out_dir)?;
            println!("Copied {} images", copied);
        }
    }
    Ok(())
}

fn print_faces(faces: &[facedex::db::FaceWithImage]) {
    for f in faces {
        println!(
            "{:>6}  [{},{},{},{}]  {}",
            f.face_id,
            f.bbox.x1,
            f.bbox.y1,
            f.bbox.x2,
            f.bbox.y2,
            f.absolute_path.display()
        );
    }
    println!("{} faces", faces.len());
}

use std::fs;
use std::path::{Path, PathBuf};
use theme_shm::cache::{ItemKind, LocalLock, OffsetMapBuilder, SharedCache};
use theme_shm::config::ShmConfig;
use theme_shm::defrag::defragment_chunk;
use theme_shm::logging::{info, init_logging, warn};
use theme_shm::manager::{MemoryManager, SharedMemoryManager};
use theme_shm::report::MemoryReport;
use theme_shm::segment::Segment;

const USAGE: &str = "Usage: theme-shm-admin [--config <file>] <command>\n\n\
Commands:\n  \
  report [--json]                              Print segment usage\n  \
  lookup <layout|stylesheet|effect> <key>      Look up a cached offset\n  \
  build-image --input <dir>... --output <file> Build a compacted stylesheet image";

#[derive(Debug)]
enum Command {
    Report { json: bool },
    Lookup { kind: ItemKind, key: String },
    BuildImage { inputs: Vec<PathBuf>, output: PathBuf },
}

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path = args.get(i).ok_or("--config requires an argument")?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => rest.push(other.to_string()),
        }
        i += 1;
    }

    let Some((name, params)) = rest.split_first() else {
        return Err(USAGE.to_string());
    };
    let command = match name.as_str() {
        "report" => match params {
            [] => Command::Report { json: false },
            [flag] if flag == "--json" => Command::Report { json: true },
            _ => return Err(format!("Unexpected arguments for report: {}", params.join(" "))),
        },
        "lookup" => match params {
            [kind, key] => Command::Lookup {
                kind: ItemKind::parse(kind).ok_or_else(|| format!("Unknown item kind: {}", kind))?,
                key: key.clone(),
            },
            _ => return Err("lookup requires <kind> <key>".to_string()),
        },
        "build-image" => parse_build_image(params)?,
        other => return Err(format!("Unknown command: {}\n\n{}", other, USAGE)),
    };
    Ok(Args { config, command })
}

fn parse_build_image(params: &[String]) -> Result<Command, String> {
    let mut inputs = Vec::new();
    let mut output = None;
    let mut i = 0;
    while i < params.len() {
        match params[i].as_str() {
            "--input" => {
                i += 1;
                let dir = params.get(i).ok_or("--input requires an argument")?;
                inputs.push(PathBuf::from(dir));
            }
            "--output" => {
                i += 1;
                let file = params.get(i).ok_or("--output requires an argument")?;
                output = Some(PathBuf::from(file));
            }
            arg => return Err(format!("Unknown option: {}", arg)),
        }
        i += 1;
    }
    if inputs.is_empty() {
        return Err("build-image requires at least one --input".to_string());
    }
    let output = output.ok_or("build-image requires --output")?;
    Ok(Command::BuildImage { inputs, output })
}

fn load_config(path: Option<&Path>) -> Result<ShmConfig, String> {
    match path {
        Some(path) => ShmConfig::load(path),
        None => ShmConfig::from_env(),
    }
    .map_err(|e| e.to_string())
}

#[cfg(unix)]
fn attach_client(config: &ShmConfig) -> Result<SharedMemoryManager, String> {
    SharedMemoryManager::initialize(config, theme_shm::config::Role::Client).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn attach_client(_config: &ShmConfig) -> Result<SharedMemoryManager, String> {
    Err("shared segments are only available on unix platforms".to_string())
}

fn report(config: &ShmConfig, json: bool) -> Result<(), String> {
    let manager = attach_client(config)?;
    let report = MemoryReport::collect(&manager);
    if json {
        println!("{}", report.to_json().map_err(|e| e.to_string())?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

fn lookup(config: &ShmConfig, kind: ItemKind, key: &str) -> Result<(), String> {
    let manager = attach_client(config)?;
    let lock = theme_shm::cache::open_lock(&config.cache.semaphore, theme_shm::config::Role::Client)
        .map_err(|e| e.to_string())?;
    let cache = SharedCache::init_client(&manager, lock).ok_or("no shared cache published yet")?;

    match cache.offset(&manager, kind, key) {
        Some(offset) => {
            println!("{} {} -> {} ({} bytes)", kind, key, offset, manager.allocated_size(offset));
            Ok(())
        }
        None => Err(format!("{} {} not cached", kind, key)),
    }
}

/// Stylesheet files under `dirs`, largest first
fn collect_stylesheets(dirs: &[PathBuf]) -> Result<Vec<(PathBuf, u64)>, String> {
    let mut files = Vec::new();
    for dir in dirs {
        let pattern = format!("{}/**/*.css", dir.display());
        for entry in glob::glob(&pattern).map_err(|e| format!("Glob pattern error: {}", e))? {
            match entry {
                Ok(path) if path.is_file() => {
                    let len = fs::metadata(&path).map_err(|e| e.to_string())?.len();
                    files.push((path, len));
                }
                Ok(_) => {}
                Err(e) => eprintln!("Error accessing path: {}", e),
            }
        }
    }
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(files)
}

fn build_image(config: &ShmConfig, inputs: &[PathBuf], output: &Path) -> Result<(), String> {
    let segment = Segment::anonymous(config.segment.size).map_err(|e| e.to_string())?;
    let mut manager = SharedMemoryManager::with_segment(segment, None).map_err(|e| e.to_string())?;
    manager.enable_cell_tracking();

    let mut builder = OffsetMapBuilder::new();
    let mut cached = 0usize;
    for (path, len) in collect_stylesheets(inputs)? {
        let Some(file) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        let (widget, color) = match file.strip_suffix("_color.css") {
            Some(widget) => (widget, true),
            None => (file.trim_end_matches(".css"), false),
        };
        if len == 0 {
            warn!(path = %path.display(), "empty stylesheet skipped");
            continue;
        }

        let data = fs::read(&path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let at = match manager.alloc(data.len()) {
            Ok(at) => at,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "stylesheet left out of the image");
                continue;
            }
        };
        if let Some(target) = manager.bytes_mut(at, data.len()) {
            target.copy_from_slice(&data);
        }
        let result = if color {
            builder.add_widget_offsets(widget, None, Some(at))
        } else {
            builder.add_widget_offsets(widget, Some(at), None)
        };
        result.map_err(|e| e.to_string())?;
        cached += 1;
    }

    let map = builder.build();
    SharedCache::init_server(
        &mut manager,
        Some(&map),
        config.cache.effect_reserve,
        Box::new(LocalLock::new()),
    )
    .map_err(|e| e.to_string())?;

    let end = defragment_chunk(&mut manager).map_err(|e| e.to_string())?;
    manager.write_image(output, end).map_err(|e| e.to_string())?;
    info!(stylesheets = cached, widgets = map.len(), bytes = end, "image built");
    println!(
        "Wrote {} ({} bytes, {} stylesheets, {} widgets)",
        output.display(),
        end,
        cached,
        map.len()
    );
    Ok(())
}

fn run() -> Result<(), String> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;
    let config = load_config(args.config.as_deref())?;
    let _guard = init_logging(config.log_config());

    match args.command {
        Command::Report { json } => report(&config, json),
        Command::Lookup { kind, key } => lookup(&config, kind, &key),
        Command::BuildImage { inputs, output } => build_image(&config, &inputs, &output),
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

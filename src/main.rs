use std::env;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::time::Duration;

use tqcache::{Durability, Engine, EngineConfig};

fn main() {
    env_logger::init();
    if let Err(error) = run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn run() -> io::Result<()> {
    let mut args = env::args().skip(1);
    let config = load_config();

    match args.next().as_deref() {
        Some("serve") => {
            let engine = Engine::open(config).map_err(to_io_error)?;
            let addr = args.next().unwrap_or_else(|| "127.0.0.1:11311".to_string());
            tqcache::server::run(&addr, engine)
        }
        Some("put") => {
            let engine = Engine::open(config).map_err(to_io_error)?;
            let key = next_arg(&mut args, "key")?;
            let value = next_arg(&mut args, "value")?;
            let cas = engine.set(key.as_bytes(), value.as_bytes(), Duration::ZERO).map_err(to_io_error)?;
            println!("stored cas={cas}");
            Ok(())
        }
        Some("get") => {
            let engine = Engine::open(config).map_err(to_io_error)?;
            let key = next_arg(&mut args, "key")?;
            match engine.get(key.as_bytes()) {
                Ok((value, cas)) => println!("{} (cas={cas})", String::from_utf8_lossy(&value)),
                Err(tqcache::EngineError::KeyNotFound) => println!("key not found"),
                Err(err) => return Err(to_io_error(err)),
            }
            Ok(())
        }
        Some("delete") => {
            let engine = Engine::open(config).map_err(to_io_error)?;
            let key = next_arg(&mut args, "key")?;
            engine.delete(key.as_bytes()).map_err(to_io_error)?;
            println!("deleted");
            Ok(())
        }
        Some("stats") => {
            let engine = Engine::open(config).map_err(to_io_error)?;
            let stats = engine.stats().map_err(to_io_error)?;
            println!("curr_items: {}", stats.curr_items);
            println!("bytes: {}", stats.bytes);
            println!("allocated_bytes: {}", stats.allocated_bytes);
            println!("pid: {}", stats.pid);
            println!("uptime: {}s", stats.uptime.as_secs());
            println!("version: {}", stats.version);
            Ok(())
        }
        Some("help") | None => {
            print_usage();
            Ok(())
        }
        Some(cmd) => Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("unknown command `{cmd}`"),
        )),
    }
}

fn next_arg(args: &mut impl Iterator<Item = String>, name: &str) -> io::Result<String> {
    args.next()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("missing {name}")))
}

fn to_io_error(err: tqcache::EngineError) -> io::Error {
    io::Error::new(ErrorKind::Other, err.to_string())
}

fn load_config() -> EngineConfig {
    let data_dir = env::var("TQCACHE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"));
    let mut builder = EngineConfig::builder(data_dir);
    if let Ok(count) = env::var("TQCACHE_SHARD_COUNT") {
        if let Ok(count) = count.parse() {
            builder = builder.shard_count(count);
        }
    }
    if env::var("TQCACHE_DURABILITY").as_deref() == Ok("always") {
        builder = builder.durability(Durability::Always);
    } else if env::var("TQCACHE_DURABILITY").as_deref() == Ok("none") {
        builder = builder.durability(Durability::None);
    }
    builder.build()
}

fn print_usage() {
    println!("tqcache CLI");
    println!("Usage:");
    println!("  tqcache serve [addr]");
    println!("  tqcache put <key> <value>");
    println!("  tqcache get <key>");
    println!("  tqcache delete <key>");
    println!("  tqcache stats");
    println!("Set TQCACHE_DATA_DIR to override the storage directory.");
    println!("Set TQCACHE_SHARD_COUNT and TQCACHE_DURABILITY (none|always|periodic) to tune the engine.");
}

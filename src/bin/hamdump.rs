//! hamdump - dump the contents of a hamdb environment.
//!
//! Usage: hamdump FILE [DBNAME]
//!
//! Opens the environment read-only and prints every key/record pair of
//! every database (or just the named one). Printable bytes are shown as
//! text, everything else as hex. Exits 0 on success, 1 on any error.

use std::env;
use std::process::ExitCode;

use hamdb::{CursorFlags, DbParams, EnvFlags, EnvParams, Environment, ErrorCode};

/// Render a byte string: plain when printable ASCII, hex otherwise.
fn render(bytes: &[u8]) -> String {
    if !bytes.is_empty() && bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        format!("0x{}", hex::encode(bytes))
    }
}

fn dump_database(env: &Environment, name: u16) -> hamdb::Result<()> {
    let db = env.open_db(name, &DbParams::default())?;
    println!("=== database {} ===", name);

    let cursor = db.cursor(None)?;
    let mut move_flags = CursorFlags::FIRST;
    let mut count = 0u64;
    loop {
        match cursor.move_to(move_flags) {
            Ok((key, record)) => {
                println!("{}\t{}", render(&key.data), render(&record.data));
                count += 1;
            }
            Err(e) if e.code() == ErrorCode::KeyNotFound => break,
            Err(e) => return Err(e),
        }
        move_flags = CursorFlags::NEXT;
    }
    println!("({} records)", count);
    drop(cursor);
    db.close()
}

fn run(path: &str, only: Option<u16>) -> hamdb::Result<()> {
    let env = Environment::open(path, EnvFlags::READ_ONLY, &EnvParams::default())?;
    println!("environment {} (serial {:#010x})", path, env.serial()?);

    let names = match only {
        Some(name) => vec![name],
        None => env.get_database_names()?,
    };
    for name in names {
        dump_database(&env, name)?;
    }
    env.close()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("usage: hamdump FILE [DBNAME]");
        return ExitCode::FAILURE;
    }

    let only = match args.get(2) {
        Some(arg) => match arg.parse::<u16>() {
            Ok(name) => Some(name),
            Err(_) => {
                eprintln!("hamdump: '{}' is not a database name", arg);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    match run(&args[1], only) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hamdump: {}", e);
            ExitCode::FAILURE
        }
    }
}

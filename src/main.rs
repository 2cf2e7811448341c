use package_ingest::{
    DispatchConfig, DispatchError, LimitOverrides, ParsedImportPackage, RawFilesSelector, WorkerRequest,
    dispatch_import, list, read_package,
};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = &args[1];

    match command.as_str() {
        "inspect" => {
            if args.len() < 3 {
                eprintln!("Error: inspect requires a package file");
                print_usage();
                std::process::exit(1);
            }
            let opts = match parse_inspect_flags(&args[3..]) {
                Ok(opts) => opts,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    print_usage();
                    std::process::exit(1);
                }
            };
            inspect(&args[2], opts);
        }
        "list" => {
            if args.len() < 3 {
                eprintln!("Error: list requires a package file");
                print_usage();
                std::process::exit(1);
            }
            let package = &args[2];
            match list(Path::new(package), &LimitOverrides::default().resolve()) {
                Ok((package_type, entries)) => {
                    println!("{} ({}):", package, package_type);
                    println!("{:>10}  {:<20}  {}", "Size", "Modified", "Name");
                    println!("{}", "-".repeat(60));
                    for entry in &entries {
                        let modified = entry
                            .modified
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                            .unwrap_or_default();
                        println!("{:>10}  {:<20}  {}", entry.size, modified, entry.path);
                    }
                    println!("\nTotal: {} file(s)", entries.len());
                }
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            std::process::exit(1);
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct InspectFlags {
    source: Option<String>,
    limits: LimitOverrides,
    sync: bool,
}

fn parse_inspect_flags(args: &[String]) -> Result<InspectFlags, String> {
    let mut flags = InspectFlags::default();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        if flag == "--sync" {
            flags.sync = true;
            continue;
        }
        let value = iter.next().ok_or_else(|| format!("{} requires a value", flag))?;
        let number = || value.parse::<u64>().map_err(|_| format!("{} expects a number, got '{}'", flag, value));
        match flag.as_str() {
            "--source" => flags.source = Some(value.clone()),
            "--max-bytes" => flags.limits.max_uncompressed_bytes = Some(number()?),
            "--max-file-bytes" => flags.limits.max_single_file_bytes = Some(number()?),
            "--max-entries" => {
                let n = number()?;
                flags.limits.max_archive_entries = Some(usize::try_from(n).map_err(|e| e.to_string())?);
            }
            "--max-depth" => {
                let n = number()?;
                flags.limits.max_nested_archive_depth = Some(u32::try_from(n).map_err(|e| e.to_string())?);
            }
            _ => return Err(format!("unknown option '{}'", flag)),
        }
    }
    Ok(flags)
}

fn inspect(package: &str, flags: InspectFlags) {
    let (file_name, bytes) = match read_package(Path::new(package)) {
        Ok(read) => read,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    let request = WorkerRequest {
        file_name,
        bytes,
        selected_source: flags.source,
        limits: flags.limits,
    };
    let config = DispatchConfig {
        use_worker: !flags.sync,
        ..Default::default()
    };

    match render_outcome(dispatch_import(request, Arc::new(RawFilesSelector), &config)) {
        Ok(json) => println!("{}", json),
        Err(line) => {
            eprintln!("{}", line);
            std::process::exit(1);
        }
    }
}

// Ok: the JSON for stdout. Err: the `CODE: message` line for stderr.
fn render_outcome(result: Result<ParsedImportPackage, DispatchError>) -> Result<String, String> {
    let parsed = result.map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&parsed).map_err(|e| format!("Error writing response: {}", e))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  inspect <package> [options]  - Validate and ingest a package, print JSON");
    eprintln!("  list <package>               - List top-level entries of a package");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --source <name>          Adapter hint (default: raw)");
    eprintln!("  --max-bytes <n>          Total uncompressed bytes");
    eprintln!("  --max-entries <n>        Total entries, nested archives included");
    eprintln!("  --max-depth <n>          Nested archive depth");
    eprintln!("  --max-file-bytes <n>     Bytes per entry");
    eprintln!("  --sync                   Ingest on the main thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_inspect_flags() {
        let flags = parse_inspect_flags(&args(&["--max-depth", "2", "--source", "raw", "--sync"])).unwrap();
        assert_eq!(flags.limits.max_nested_archive_depth, Some(2));
        assert_eq!(flags.limits.max_uncompressed_bytes, None);
        assert_eq!(flags.source.as_deref(), Some("raw"));
        assert!(flags.sync);
    }

    #[test]
    fn test_inspect_flags_defaults() {
        assert_eq!(parse_inspect_flags(&[]).unwrap(), InspectFlags::default());
    }

    #[test]
    fn test_inspect_flags_errors() {
        assert!(parse_inspect_flags(&args(&["--max-bytes"])).is_err());
        assert!(parse_inspect_flags(&args(&["--max-bytes", "lots"])).is_err());
        assert!(parse_inspect_flags(&args(&["--verbose", "1"])).is_err());
    }

    #[test]
    fn test_render_outcome() {
        let parsed = package_ingest::parse_import_payload(
            "notes.json",
            b"{}",
            &Default::default(),
            &RawFilesSelector,
        )
        .unwrap();
        let json = render_outcome(Ok(parsed)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["package_type"], "json");
        assert_eq!(value["file_count"], 1);

        let err = package_ingest::PackageParseError::format_spoofed("\"a.zip\" lacks ZIP magic");
        assert_eq!(
            render_outcome(Err(err.into())).unwrap_err(),
            "FORMAT_SPOOFED: \"a.zip\" lacks ZIP magic"
        );
        let timeout = DispatchError::Timeout(std::time::Duration::from_secs(120));
        assert_eq!(render_outcome(Err(timeout)).unwrap_err(), "import did not finish within 120s");
    }
}

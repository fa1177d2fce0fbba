//! pargz - decompress gzip files on all cores.
//!
//! A gunzip-style front end over the library: decompresses to a sibling
//! file or stdout, and can persist/reuse seek indexes so repeated access
//! to the same archive skips all speculative work.

use std::env;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::process;

use pargz::{ParallelGzipReader, PargzError, PargzResult, ReaderOptions, Source};

const VERSION: &str = concat!("pargz ", env!("CARGO_PKG_VERSION"));

const USAGE: &str = "\
usage: pargz [options] [FILE]

Decompress a gzip file in parallel. With no FILE, or when FILE is -,
reads standard input.

  -c, --stdout          write to standard output, keep input
  -k, --keep            keep the input file
  -f, --force           overwrite existing output files
  -t, --test            decode and verify, write nothing
  -p, --processes N     number of worker threads (default: all cores)
      --chunk-size MIB  decoded chunk size in MiB (default: 4)
      --export-index F  write a seek index to F after decompression
      --import-index F  load a seek index from F before decompression
      --no-verify       skip CRC-32/ISIZE verification
  -v, --verbose         print scheduling statistics to stderr
  -h, --help            show this help
  -V, --version         show version";

#[derive(Debug, Default)]
struct CliArgs {
    file: Option<String>,
    stdout: bool,
    keep: bool,
    force: bool,
    test: bool,
    processes: usize,
    chunk_size_mib: Option<u64>,
    export_index: Option<String>,
    import_index: Option<String>,
    no_verify: bool,
    verbose: bool,
    help: bool,
    version: bool,
}

impl CliArgs {
    fn parse() -> PargzResult<Self> {
        let mut args = CliArgs::default();
        let mut argv = env::args().skip(1);

        while let Some(argument) = argv.next() {
            match argument.as_str() {
                "-c" | "--stdout" | "--to-stdout" => args.stdout = true,
                "-k" | "--keep" => args.keep = true,
                "-f" | "--force" => args.force = true,
                "-t" | "--test" => args.test = true,
                "-d" | "--decompress" => {} // decompression is all we do
                "-v" | "--verbose" => args.verbose = true,
                "-h" | "--help" => args.help = true,
                "-V" | "--version" => args.version = true,
                "--no-verify" => args.no_verify = true,
                "-p" | "--processes" => {
                    args.processes = parse_number(&argument, argv.next())? as usize;
                }
                "--chunk-size" => {
                    args.chunk_size_mib = Some(parse_number(&argument, argv.next())?);
                }
                "--export-index" => {
                    args.export_index = Some(required_value(&argument, argv.next())?);
                }
                "--import-index" => {
                    args.import_index = Some(required_value(&argument, argv.next())?);
                }
                "-" => args.file = Some(argument),
                other if other.starts_with('-') => {
                    return Err(PargzError::invalid_argument(format!(
                        "unknown option {other}"
                    )));
                }
                _ => {
                    if args.file.is_some() {
                        return Err(PargzError::invalid_argument(
                            "only one input file is supported",
                        ));
                    }
                    args.file = Some(argument);
                }
            }
        }
        Ok(args)
    }
}

fn required_value(option: &str, value: Option<String>) -> PargzResult<String> {
    value.ok_or_else(|| PargzError::invalid_argument(format!("{option} needs a value")))
}

fn parse_number(option: &str, value: Option<String>) -> PargzResult<u64> {
    required_value(option, value)?
        .parse()
        .map_err(|_| PargzError::invalid_argument(format!("{option} needs a number")))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match run() {
        Ok(code) => process::exit(code),
        Err(error) => {
            eprintln!("pargz: {error}");
            process::exit(1);
        }
    }
}

fn run() -> PargzResult<i32> {
    let args = CliArgs::parse()?;

    if args.version {
        println!("{VERSION}");
        return Ok(0);
    }
    if args.help {
        println!("{USAGE}");
        return Ok(0);
    }

    let options = ReaderOptions {
        parallelization: args.processes,
        chunk_size: args.chunk_size_mib.unwrap_or(4) << 20,
        verify_checksums: !args.no_verify,
        ..ReaderOptions::default()
    };
    if options.chunk_size == 0 {
        return Err(PargzError::invalid_argument("chunk size must be positive"));
    }

    let from_stdin = matches!(args.file.as_deref(), None | Some("-"));
    let mut reader = if from_stdin {
        let mut buffered = Vec::new();
        io::stdin().lock().read_to_end(&mut buffered)?;
        ParallelGzipReader::with_options(Source::from_bytes(buffered), options)?
    } else {
        let path = args.file.as_deref().expect("checked above");
        ParallelGzipReader::with_options(Source::open(path)?, options)?
    };

    if let Some(index_path) = &args.import_index {
        reader.import_index(File::open(index_path)?)?;
    }

    if args.test {
        io::copy(&mut reader, &mut io::sink())?;
    } else if args.stdout || from_stdin {
        let stdout = io::stdout();
        let mut writer = BufWriter::new(stdout.lock());
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
    } else {
        let input = args.file.as_deref().expect("checked above");
        let output = strip_gzip_suffix(input)?;
        if Path::new(&output).exists() && !args.force {
            return Err(PargzError::invalid_argument(format!(
                "{output} already exists (use -f to overwrite)"
            )));
        }
        let mut writer = BufWriter::new(File::create(&output)?);
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
    }

    if let Some(index_path) = &args.export_index {
        reader.export_index(BufWriter::new(File::create(index_path)?))?;
    }

    if args.verbose {
        let stats = reader.statistics();
        eprintln!(
            "pargz: {} gets, {} on-demand, {} prefetched, cache hit rate {:.1}%",
            stats.gets,
            stats.on_demand_fetches,
            stats.prefetches,
            stats.cache_hit_rate() * 100.0,
        );
    }

    // gzip semantics: the input is replaced by its decompressed form.
    if !from_stdin && !args.stdout && !args.test && !args.keep {
        fs::remove_file(args.file.as_deref().expect("checked above"))?;
    }

    Ok(0)
}

fn strip_gzip_suffix(path: &str) -> PargzResult<String> {
    for suffix in [".gz", ".gzip", ".tgz"] {
        if let Some(stem) = path.strip_suffix(suffix) {
            if suffix == ".tgz" {
                return Ok(format!("{stem}.tar"));
            }
            return Ok(stem.to_string());
        }
    }
    Err(PargzError::invalid_argument(format!(
        "{path} has no known gzip suffix; use -c to write to stdout"
    )))
}

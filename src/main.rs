use heft::{*, error::*, driver::*, output::*};
use std::process;

const USAGE: &str = "heft: a size profiler for binaries.

USAGE: heft [options] file... [-- base_file...]

Options:

  --csv            Output in CSV format instead of human-readable.
  -c <file>        Load configuration from <file>.
  -d <sources>     Comma-separated list of sources to scan.
  -n <num>         How many rows to show per level before collapsing
                   other keys into '[Other]'. Defaults to 20.
  -s <sortby>      Whether to sort by VM or File size. Possible values
                   are:
                     -s vm
                     -s file
                     -s both (the default: sorts by max(vm, file)).
  -v               Verbose output. Dumps warnings encountered during
                   processing and full VM/file maps at the end.
                   Add more v's (-vv, -vvv) for even more.
  -w               Wide output; don't truncate long labels.
  --help           Display this message and exit.
  --list-sources   Show a list of available sources and exit.
";

// Returns false if we already did everything the invocation asked for
// (--help, --list-sources).
fn parse_args(args: &[String], options: &mut Options, output_options: &mut OutputOptions) -> Result<bool> {
    let mut saw_separator = false;
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i][..];
        match arg {
            "--" => {
                if saw_separator {
                    return err!(Usage, "'--' option should only be specified once");
                }
                saw_separator = true;
            }
            "--csv" => output_options.output_format = OutputFormat::Csv,
            "-c" => {
                i += 1;
                if i >= args.len() {
                    return err!(Usage, "option '-c' requires an argument");
                }
                let text = std::fs::read_to_string(&args[i])
                    .map_err(|e| Error::from_io_error(e, format!("couldn't open file {}", args[i])))?;
                parse_options_file(&text, options)?;
            }
            "-d" => {
                i += 1;
                if i >= args.len() {
                    return err!(Usage, "option '-d' requires an argument");
                }
                for name in args[i].split(',') {
                    options.data_sources.push(name.to_string());
                }
            }
            "-n" => {
                i += 1;
                if i >= args.len() {
                    return err!(Usage, "option '-n' requires an argument");
                }
                options.max_rows_per_level = args[i].parse()
                    .map_err(|_| error!(Usage, "invalid value for -n: {}", args[i]))?;
            }
            "-s" => {
                i += 1;
                if i >= args.len() {
                    return err!(Usage, "option '-s' requires an argument");
                }
                options.sort_by = parse_sort_by(&args[i])?;
            }
            "-v" => options.verbose_level = 1,
            "-vv" => options.verbose_level = 2,
            "-vvv" => options.verbose_level = 3,
            "-w" => output_options.max_label_len = usize::MAX,
            "--list-sources" => {
                for def in DATA_SOURCES {
                    eprintln!("{:<15} {}", def.name, def.description);
                }
                return Ok(false);
            }
            "--help" => {
                eprint!("{}", USAGE);
                return Ok(false);
            }
            _ if arg.starts_with('-') => return err!(Usage, "unknown option: {}", arg),
            _ => {
                if saw_separator {
                    options.base_filenames.push(arg.to_string());
                } else {
                    options.filenames.push(arg.to_string());
                }
            }
        }
        i += 1;
    }
    Ok(true)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();
    let mut output_options = OutputOptions::default();

    match parse_args(&args[1..], &mut options, &mut output_options) {
        Ok(true) => (),
        Ok(false) => return,
        Err(e) => {
            eprintln!("heft: {}", e);
            process::exit(1);
        }
    }

    let output = match run(&options) {
        Ok(output) => output,
        Err(e) => {
            eprintln!("heft: {}", e);
            process::exit(1);
        }
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = output.print(&output_options, &mut out) {
        eprintln!("heft: {}", e);
        process::exit(1);
    }
}

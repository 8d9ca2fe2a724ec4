use clap::{ArgGroup, Parser};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use env_logger::{Builder, Env};
use log::{error, Level};
use std::io::Write;
use std::path::Path;

use palmcount::color_utils::{colors, init_color_config, symbols};
use palmcount::convert::{run_convert, ConvertRequest};
use palmcount::worker::{run_infer_files, run_infer_folder};

#[derive(Parser)]
#[command(name = "palmcount", version)]
#[command(about = "Count abnormal and normal palm trees in georeferenced aerial imagery")]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .multiple(false)
        .args(["convert", "infer", "infer_files"])
))]
struct Cli {
    /// Optimize a model for the GPU and write it to MODEL_OUT
    #[arg(
        long,
        num_args = 2..=3,
        value_names = ["MODEL_IN", "MODEL_OUT", "INFERENCE_SIZE"]
    )]
    convert: Option<Vec<String>>,

    /// Process every .tif/.tiff directly inside FOLDER
    #[arg(long, num_args = 3, value_names = ["FOLDER", "MODEL_PATH", "CONFIG_JSON"])]
    infer: Option<Vec<String>>,

    /// Process an explicit JSON list of files, one output folder per file
    #[arg(
        long,
        num_args = 4,
        value_names = ["FILES_JSON", "MODEL_PATH", "MODEL_NAME", "CONFIG_JSON"]
    )]
    infer_files: Option<Vec<String>>,

    /// Verbosity level (-q/--quiet, -v/-vv for debug/trace)
    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,

    /// Disable colored diagnostics
    #[arg(long)]
    no_color: bool,
}

fn init_logging(cli: &Cli) {
    // Without -v/-q an explicit RUST_LOG wins
    let use_env = !cli.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(cli.verbosity.log_level_filter());
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => colors::error_level("ERROR"),
                Level::Warn => colors::warning_level("WARN"),
                Level::Info => colors::info_level("INFO"),
                Level::Debug => colors::debug_level("DEBUG"),
                Level::Trace => colors::trace_level("TRACE"),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .target(env_logger::Target::Stderr)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    if let Some(values) = &cli.convert {
        let request = ConvertRequest::from_args(values)?;
        run_convert(&request)?;
        return Ok(0);
    }
    if let Some(values) = &cli.infer {
        let [folder, model_path, config_json] = values.as_slice() else {
            anyhow::bail!("--infer expects <folder> <model_path> <config_json>");
        };
        return run_infer_folder(Path::new(folder), Path::new(model_path), config_json);
    }
    if let Some(values) = &cli.infer_files {
        let [files_json, model_path, model_name, config_json] = values.as_slice() else {
            anyhow::bail!(
                "--infer-files expects <files_json> <model_path> <model_name> <config_json>"
            );
        };
        return run_infer_files(files_json, Path::new(model_path), model_name, config_json);
    }
    anyhow::bail!("No mode selected")
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            // Help and version go to stdout, usage errors to stderr
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_color_config(cli.no_color);
    init_logging(&cli);

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{} {e:#}", symbols::operation_failed());
            std::process::exit(1);
        }
    }
}

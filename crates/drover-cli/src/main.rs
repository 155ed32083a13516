use clap::{value_parser, Arg, Command, ValueHint};
use drover_cli::input::Input;
use drover_cli::runner::Runner;
use drover_core::progress::CliSink;
use rayon::ThreadPoolBuilder;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(env_logger::Env::default().filter_or("DROVER_LOG", "error,drover=info"))
        .init();

    let matches = Command::new("drover")
        .version(clap::crate_version!())
        .about("Drives external spectrum search engines: validates and splits MGF input, then supervises one engine process per configured entry.")
        .arg(
            Arg::new("parameters")
                .required(true)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to configuration parameters (JSON file)")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("mgf_paths")
                .num_args(1..)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Paths to MGF files to process. Overrides MGF files listed in the \
                     configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("output_directory")
                .short('o')
                .long("output_directory")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path where the input list and engine results are collected. \
                     Overrides the directory specified in the configuration file.",
                )
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_parser(value_parser!(u16).range(1..))
                .help("Number of engine processes to supervise in parallel (default = # of CPUs)")
                .value_hint(ValueHint::Other),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    let input = Input::from_arguments(matches)?;
    let config = input.build()?;

    ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build_global()
        .expect("configure rayon pool");

    let runner = Runner::new(config)?;
    let sink = CliSink::new();
    let summary = runner.run(&sink)?;

    if summary.failed > 0 {
        anyhow::bail!("{} search engine run(s) failed", summary.failed);
    }
    if summary.canceled > 0 {
        anyhow::bail!("run canceled after a search engine reported an error");
    }

    Ok(())
}

mod cli;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("--footsteps") => cli::run_footsteps(),
        Some("--voice") => cli::run_voice_stream(),
        _ => cli::run_all(),
    }
}

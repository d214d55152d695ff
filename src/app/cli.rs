use super::*;

pub(super) fn run_cli(cli: Cli) -> i32 {
    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return EXIT_CONFIG;
        }
    };

    if cli.check {
        println!("{}: ok", cli.config.display());
        return EXIT_OK;
    }

    if let Err(e) = ops::init_logging(&config.log) {
        eprintln!("{e:#}");
        return EXIT_CONFIG;
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            return EXIT_RUNTIME;
        }
    };

    match rt.block_on(engine::run(config)) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("{e:#}");
            EXIT_RUNTIME
        }
    }
}

use groom::{cli, config, daemon, telemetry, txn};

fn main() {
    let cli = cli::parse_from(std::env::args_os());
    telemetry::init(cli.verbose);

    let cfg = config::load();
    let result = if cli.execute {
        txn::driver::run(&cfg).map_err(groom::Error::from)
    } else {
        daemon::run(cfg)
    };

    if let Err(e) = result {
        tracing::error!("error: {}", e);
        std::process::exit(1);
    }
}

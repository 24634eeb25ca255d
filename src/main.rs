use clap::Parser;
use getman_runner::cli::{self, Cli};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let ctx = match cli::load_context(&cli) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("{err}");
            std::process::exit(cli::exit_code_for_error(&err));
        }
    };

    let ctrl_c_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = ctrl_c_ctx.cancel_all();
            info!(cancelled, "Interrupted, cancelling running executions");
        }
    });

    let code = match cli::execute(cli.command, &ctx).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            cli::exit_code_for_error(&err)
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

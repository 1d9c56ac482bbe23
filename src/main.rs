use anyhow::{Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use bwcontrol::backends::{IptablesSink, XtQuotaControl};
use bwcontrol::config::Config;
use bwcontrol::protocol::{self, ResponseCode};
use bwcontrol::{BandwidthController, command, server};

/// bwcontrol - bandwidth accounting and quota controller for iptables hosts
#[derive(Parser, Debug)]
#[command(name = "bwcontrol")]
#[command(version = "0.6.0")]
#[command(about = "Bandwidth accounting, quotas, alerts and tethering stats over iptables", long_about = None)]
struct Args {
    /// Config file (default: ~/.config/bwcontrol/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Socket to serve the command protocol on (overrides the config)
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short)]
    verbose: bool,

    /// Write the default configuration to the config path and exit
    #[arg(long)]
    write_default_config: bool,

    /// Run a single command line (e.g. "bandwidth gettetherstats"), print the response and exit
    #[arg(long, value_name = "COMMAND")]
    once: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    pretty_env_logger::formatted_builder()
        .filter_level(level)
        .parse_default_env()
        .init();

    if args.write_default_config {
        Config::default().save(args.config.as_deref())?;
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;

    let sink = IptablesSink::new(
        &config.iptables_path,
        &config.ip6tables_path,
        &config.iptables_restore_path,
        &config.ip6tables_restore_path,
    );
    if !sink.is_available() {
        log::warn!("{:?} could not be executed", config.iptables_path);
    }
    let controller = Arc::new(BandwidthController::new(
        Arc::new(sink),
        Arc::new(XtQuotaControl::new(&config.xt_quota_dir)),
    ));

    if config.setup_on_start {
        controller.setup_hooks()?;
    }
    if config.enable_on_start {
        controller.enable_accounting(false)?;
    }

    if let Some(line) = args.once {
        let lines = command::dispatch(&controller, &line);
        print!("{}", protocol::format_response(&lines));
        if let Some(failure) = lines
            .iter()
            .find(|l| l.code.code() >= ResponseCode::OperationFailed.code())
        {
            bail!("command failed: {}", failure);
        }
        return Ok(());
    }

    let socket = args.socket.unwrap_or(config.socket_path);
    server::serve(controller, &socket).await
}

//! Development entry point: runs the Template Provider against the
//! in-process [`template_provider::chain::mock::MockChain`], which serves
//! deterministic regtest-style templates. Useful for driving sv2 client
//! integration tests without a full node; production deployments embed the
//! library with a real [`template_provider::chain::ChainSource`].

use std::{fs::OpenOptions, io, path::Path, sync::Arc, time::Duration};

use template_provider::{
    chain::mock::MockChain, config::TemplateProviderConfig, TemplateProvider,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

mod args {
    use std::path::PathBuf;

    #[derive(Debug)]
    pub struct Args {
        pub config_path: PathBuf,
    }

    enum ArgsState {
        Next,
        ExpectPath,
        Done,
    }

    enum ArgsResult {
        Config(PathBuf),
        None,
        Help(String),
    }

    impl Args {
        const DEFAULT_CONFIG_PATH: &'static str = "template-provider-config.toml";

        pub fn from_args() -> Result<Self, String> {
            let cli_args = std::env::args();

            let config_path = cli_args
                .scan(ArgsState::Next, |state, item| {
                    match std::mem::replace(state, ArgsState::Done) {
                        ArgsState::Next => match item.as_str() {
                            "-c" | "--config" => {
                                *state = ArgsState::ExpectPath;
                                Some(ArgsResult::None)
                            }
                            "-h" | "--help" => Some(ArgsResult::Help(format!(
                                "Usage: -h/--help, -c/--config <path|default {}>",
                                Self::DEFAULT_CONFIG_PATH
                            ))),
                            _ => {
                                *state = ArgsState::Next;
                                Some(ArgsResult::None)
                            }
                        },
                        ArgsState::ExpectPath => Some(ArgsResult::Config(PathBuf::from(item))),
                        ArgsState::Done => None,
                    }
                })
                .last();
            let config_path = match config_path {
                Some(ArgsResult::Config(p)) => p,
                Some(ArgsResult::Help(h)) => return Err(h),
                _ => PathBuf::from(Self::DEFAULT_CONFIG_PATH),
            };
            Ok(Self { config_path })
        }
    }
}

/// Initialize logging to stdout and optionally to a file.
fn init_logging(log_file: Option<&Path>) {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::new(rust_log);

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match log_file {
        Some(path) => {
            let path = path.to_owned();
            let file_layer = fmt::layer().with_writer(move || {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .expect("Failed to open log file")
            });
            let stdout_layer = fmt::layer().with_writer(io::stdout);
            Box::new(
                Registry::default()
                    .with(env_filter)
                    .with(stdout_layer)
                    .with(file_layer),
            )
        }
        None => {
            let stdout_layer = fmt::layer().with_writer(io::stdout);
            Box::new(Registry::default().with(env_filter).with(stdout_layer))
        }
    };

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");
}

fn main() {
    let args = match args::Args::from_args() {
        Ok(args) => args,
        Err(help) => {
            eprintln!("{}", help);
            return;
        }
    };

    let config = if args.config_path.exists() {
        match TemplateProviderConfig::from_file(&args.config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to read config {:?}: {}", args.config_path, e);
                return;
            }
        }
    } else {
        TemplateProviderConfig::default()
    };

    init_logging(config.log_file.as_deref());
    info!(
        "Template Provider INITIALIZING with config: {:?}",
        args.config_path
    );

    let chain = Arc::new(MockChain::new());
    let provider = match TemplateProvider::start(config, chain) {
        Ok(provider) => provider,
        Err(e) => {
            error!("Could not start Template Provider: {}", e);
            return;
        }
    };

    info!(
        "Authority public key: {}",
        hex::encode(provider.authority_public_key().serialize())
    );
    info!(
        "Static public key: {}",
        hex::encode(provider.static_public_key().serialize())
    );

    while !provider.is_interrupted() {
        std::thread::sleep(Duration::from_secs(1));
    }
    error!("Template Provider handler stopped; shutting down");
}

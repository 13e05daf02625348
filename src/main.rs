//! localsign CLI
//!
//! Entry point for the `localsign` command-line tool.

use clap::{Parser, Subcommand};
use localsign::config::DEFAULT_CONFIG_FILE;
use localsign::logging::{init_tracing, DEFAULT_FILTER};
use localsign::{CliSigningOptions, Config, ConfigError, EffectiveConfig, SigningService};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "localsign")]
#[command(about = "Sign iOS app bundles with a local builder", version)]
struct Cli {
    /// Path to the config file
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign an .ipa file and wait for the result
    Sign {
        /// Unsigned .ipa to sign
        #[arg(long)]
        ipa: PathBuf,

        /// Signing profile name
        #[arg(long)]
        profile: String,

        /// Where to write the signed .ipa
        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Extra arguments for the sign script
        #[arg(long, default_value = "")]
        args: String,

        /// Bundle id override
        #[arg(long, default_value = "")]
        bundle_id: String,

        /// Builder id (default: first configured builder)
        #[arg(long)]
        builder: Option<String>,

        /// Prompt for a two-factor code while the job runs
        #[arg(long = "prompt-2fa")]
        prompt_2fa: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration with secrets redacted
    Show,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(DEFAULT_FILTER, cli.log_json);

    match cli.command {
        Commands::Sign {
            ipa,
            profile,
            output,
            args,
            bundle_id,
            builder,
            prompt_2fa,
        } => {
            let effective = load_config(Config::load(&cli.config));
            let options = CliSigningOptions {
                ipa,
                profile,
                output,
                sign_args: args,
                user_bundle_id: bundle_id,
                builder_id: builder,
                prompt_two_factor: prompt_2fa,
            };
            run_sign(effective.config, &options);
        }
        Commands::Config { action } => match action {
            ConfigCommands::Show => run_config_show(&load_config(Config::inspect(&cli.config))),
        },
    }
}

fn load_config(loaded: Result<EffectiveConfig, ConfigError>) -> EffectiveConfig {
    match loaded {
        Ok(effective) => effective,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(1);
        }
    }
}

fn run_sign(config: Config, options: &CliSigningOptions) {
    let service = match SigningService::new(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    match service.sign_file(options) {
        Ok(_) => println!("Signed app written to {}", options.output.display()),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_config_show(effective: &EffectiveConfig) {
    match effective.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing config: {}", e);
            process::exit(1);
        }
    }
}

//! Command-line argument parsing.
//!
//! Grounded on `Cli`/`SharedOpts`/`Commands`/`default_config` in
//! `examples/yaleman-goatns/src/cli.rs`. The daemon's own flag set
//! (`-v`/`-r`/`-p`/`-d`) mirrors the option parsing in
//! `examples/original_source/src/pvdd.c`'s `main()`, mapped onto the
//! teacher's `clap` derive shape.

use clap::*;

use crate::config::ConfigFile;

#[derive(Parser, Clone)]
pub struct SharedOpts {
    #[clap(short, long, help = "Configuration file")]
    config: Option<String>,
    #[clap(short, long, help = "Verbose (debug-level) logging")]
    verbose: bool,
    #[clap(
        short = 'r',
        long = "use-cached-ra",
        help = "Skip the kernel PvD probe, go straight to RA parsing"
    )]
    use_cached_ra: bool,
    #[clap(short, long, help = "Listen port")]
    port: Option<u16>,
    #[clap(short, long, help = "Persisted-state directory (accepted, unused)")]
    dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    Server {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    ConfigCheck {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    ExportConfig {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Server {
            sopt: SharedOpts {
                config: None,
                verbose: false,
                use_cached_ra: false,
                port: None,
                dir: None,
            },
        }
    }
}

#[derive(Parser)]
#[command(arg_required_else_help(false))]
/// Provisioning Domain registry daemon.
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    fn sopt(&self) -> SharedOpts {
        match &self.command {
            Some(Commands::Server { sopt })
            | Some(Commands::ConfigCheck { sopt })
            | Some(Commands::ExportConfig { sopt }) => sopt.clone(),
            None => SharedOpts {
                config: None,
                verbose: false,
                use_cached_ra: false,
                port: None,
                dir: None,
            },
        }
    }

    pub fn config_path(&self) -> Option<String> {
        self.sopt().config
    }

    pub fn verbose(&self) -> bool {
        self.sopt().verbose
    }

    /// Applies CLI overrides on top of a file/environment-loaded config,
    /// matching the precedence order defaults < file < environment < CLI
    /// flags documented in SPEC_FULL.md section 2.
    pub fn apply_overrides(&self, mut config: ConfigFile) -> ConfigFile {
        let sopt = self.sopt();
        if sopt.verbose {
            config.verbose = true;
        }
        if sopt.use_cached_ra {
            config.use_cached_ra = true;
        }
        if let Some(port) = sopt.port {
            config.port = port;
        }
        if let Some(dir) = sopt.dir {
            config.persistence_dir = Some(dir.into());
        }
        config
    }

    pub fn is_config_check(&self) -> bool {
        matches!(self.command, Some(Commands::ConfigCheck { .. }))
    }

    pub fn is_export_config(&self) -> bool {
        matches!(self.command, Some(Commands::ExportConfig { .. }))
    }
}

/// Prints the effective default configuration as JSON, per the
/// `export-config` subcommand.
pub fn default_config() {
    println!("{}", ConfigFile::default().as_json_pretty());
}

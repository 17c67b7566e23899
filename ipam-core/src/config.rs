//! hostipam process configs

pub mod cli {
    //! Parse from either cli or env var

    /// default path of the sqlite store
    pub static DEFAULT_STORE_PATH: &str = "/var/lib/hostipam/ipam.db";
    /// `--store-path` value that disables persistence
    pub static STORE_PATH_NONE: &str = "none";
    /// default log level. Can use this argument or IPAM_LOG env var
    pub const DEFAULT_IPAM_LOG: &str = "info";

    use std::path::PathBuf;

    use ::config::SourceOptions;
    use address_manager::{LOCAL_DEFAULT_ADDRESS_SPACE_ID, OPT_ADDRESS_ID, OPT_INTERFACE_NAME, Options};
    use anyhow::Result;
    pub use clap::Parser;
    use clap::{Args, Subcommand};
    use tracing::debug;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "hostipam", bin_name = "hostipam", about, long_about = None)]
    /// parses from cli & environment var. hostipam will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to the sqlite store, "none" keeps everything in memory
        #[clap(long, env = "IPAM_STORE_PATH", value_parser, default_value = DEFAULT_STORE_PATH)]
        pub store_path: String,
        /// path to the topology source options (YAML or JSON)
        #[clap(short, long, env = "IPAM_CONFIG_PATH", value_parser)]
        pub config_path: Option<PathBuf>,
        /// topology source to start: "", "null", "cloud" or "file". Overrides the options file
        #[clap(short, long, env = "IPAM_ENVIRONMENT", value_parser)]
        pub environment: Option<String>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_IPAM_LOG)]
        pub ipam_log: String,
        /// operation to perform
        #[clap(subcommand)]
        pub command: Command,
    }

    /// One address manager operation per invocation
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// print the default local & global address space ids
        Spaces,
        /// hold a pool, a specific one with --pool-id or any free one
        RequestPool {
            #[clap(flatten)]
            pool: PoolArgs,
            /// sub pool id, accepted for compatibility and otherwise unused
            #[clap(long, value_parser, default_value = "")]
            sub_pool_id: String,
            /// pick an IPv6 pool
            #[clap(long)]
            v6: bool,
            #[clap(flatten)]
            options: OptionArgs,
        },
        /// release a pool held with request-pool
        ReleasePool {
            #[clap(flatten)]
            pool: PoolArgs,
        },
        /// print a pool's current state
        PoolInfo {
            #[clap(flatten)]
            pool: PoolArgs,
        },
        /// lease an address, a specific one with --address or any free one
        RequestAddress {
            #[clap(flatten)]
            pool: PoolArgs,
            /// address to lease
            #[clap(long, value_parser, default_value = "")]
            address: String,
            #[clap(flatten)]
            options: OptionArgs,
        },
        /// release a leased address, by --address or by --id
        ReleaseAddress {
            #[clap(flatten)]
            pool: PoolArgs,
            /// address to release
            #[clap(long, value_parser, default_value = "")]
            address: String,
            #[clap(flatten)]
            options: OptionArgs,
        },
    }

    /// Which pool to operate on
    #[derive(Args, Debug, Clone, PartialEq, Eq)]
    pub struct PoolArgs {
        /// address space id
        #[clap(long, value_parser, default_value = LOCAL_DEFAULT_ADDRESS_SPACE_ID)]
        pub address_space: String,
        /// pool id (subnet in CIDR notation), empty for any
        #[clap(long, value_parser, default_value = "")]
        pub pool_id: String,
    }

    /// Options forwarded to the address manager
    #[derive(Args, Debug, Clone, PartialEq, Eq, Default)]
    pub struct OptionArgs {
        /// owner of the address, lets the same owner find its address again
        #[clap(long, value_parser)]
        pub id: Option<String>,
        /// interface a wildcard pool request should prefer
        #[clap(long, value_parser)]
        pub interface_name: Option<String>,
        /// extra options as key=value, may be repeated
        #[clap(long = "option", value_parser = parse_option)]
        pub options: Vec<(String, String)>,
    }

    impl OptionArgs {
        /// request options map, `--id` and `--interface-name` stored under
        /// their option keys
        pub fn to_options(&self) -> Options {
            let mut opts = self.options.iter().cloned().collect::<Options>();
            if let Some(id) = &self.id {
                opts.insert(OPT_ADDRESS_ID.to_owned(), id.clone());
            }
            if let Some(name) = &self.interface_name {
                opts.insert(OPT_INTERFACE_NAME.to_owned(), name.clone());
            }
            opts
        }
    }

    fn parse_option(s: &str) -> Result<(String, String), String> {
        s.split_once('=')
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .ok_or_else(|| format!("invalid option {s:?}, expected key=value"))
    }

    impl Config {
        /// store location, `None` when persistence is disabled
        pub fn store_path(&self) -> Option<PathBuf> {
            if self.store_path.is_empty() || self.store_path == STORE_PATH_NONE {
                None
            } else {
                Some(PathBuf::from(&self.store_path))
            }
        }

        /// topology source options from the options file, if any, with
        /// `--environment` applied on top
        pub fn source_options(&self) -> Result<SourceOptions> {
            let mut opts = match &self.config_path {
                Some(path) => SourceOptions::parse(path)?,
                None => SourceOptions::default(),
            };
            if let Some(env) = &self.environment {
                opts.environment = env.clone();
            }
            debug!(?opts, "using source options");
            Ok(opts)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_request_address() {
            let config = Config::try_parse_from([
                "hostipam",
                "--store-path",
                "none",
                "--environment",
                "null",
                "request-address",
                "--pool-id",
                "10.0.1.0/24",
                "--id",
                "container-1",
                "--option",
                "ipam.query.url=http://localhost",
            ])
            .unwrap();
            assert_eq!(config.store_path(), None);
            assert_eq!(config.source_options().unwrap().environment, "null");
            let Command::RequestAddress { pool, address, options } = &config.command else {
                panic!("wrong command {:?}", config.command);
            };
            assert_eq!(pool.address_space, "local");
            assert_eq!(pool.pool_id, "10.0.1.0/24");
            assert_eq!(address, "");
            let opts = options.to_options();
            assert_eq!(opts.get(OPT_ADDRESS_ID).map(String::as_str), Some("container-1"));
            assert_eq!(
                opts.get("ipam.query.url").map(String::as_str),
                Some("http://localhost")
            );
        }

        #[test]
        fn test_defaults() {
            let config = Config::try_parse_from(["hostipam", "spaces"]).unwrap();
            assert_eq!(config.command, Command::Spaces);
            // env may override these on a dev box, only check when unset
            if std::env::var("IPAM_STORE_PATH").is_err() {
                assert_eq!(config.store_path(), Some(PathBuf::from(DEFAULT_STORE_PATH)));
            }
            if std::env::var("IPAM_LOG").is_err() {
                assert_eq!(config.ipam_log, DEFAULT_IPAM_LOG);
            }
        }

        #[test]
        fn test_request_pool_flags() {
            let config =
                Config::try_parse_from(["hostipam", "request-pool", "--address-space", "global", "--v6"]).unwrap();
            let Command::RequestPool { pool, v6, sub_pool_id, options } = config.command else {
                panic!("wrong command");
            };
            assert_eq!(pool.address_space, "global");
            assert_eq!(pool.pool_id, "");
            assert_eq!(sub_pool_id, "");
            assert!(v6);
            assert!(options.to_options().is_empty());

            let config = Config::try_parse_from(["hostipam", "request-pool", "--interface-name", "eth1"]).unwrap();
            let Command::RequestPool { options, .. } = config.command else {
                panic!("wrong command");
            };
            assert_eq!(
                options.to_options().get(OPT_INTERFACE_NAME).map(String::as_str),
                Some("eth1")
            );
        }

        #[test]
        fn test_invalid_option() {
            assert!(
                Config::try_parse_from(["hostipam", "request-address", "--option", "novalue"]).is_err()
            );
            assert!(Config::try_parse_from(["hostipam"]).is_err());
        }

        #[test]
        fn test_source_options_file() {
            let mut config = Config::try_parse_from(["hostipam", "spaces"]).unwrap();
            config.config_path = Some(PathBuf::from("/definitely/not/here.yaml"));
            config.environment = None;
            assert!(config.source_options().is_err());
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for the tracing subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. The format comes from `LOG_FORMAT`.
        /// Logs go to stderr, stdout carries the command's result.
        pub fn parse(ipam_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            // Log level comes from IPAM_LOG
            let filter = EnvFilter::try_new(ipam_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json().with_writer(std::io::stderr))
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(Format::default().pretty().with_source_location(false))
                                .fmt_fields(PrettyFields::new())
                                .with_writer(std::io::stderr),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}

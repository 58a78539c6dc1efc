//! Canopy server replica executable.

use std::collections::HashSet;
use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use canopy::{pf_error, CanopyError, ReplicaId, VrReplica};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica ID of myself.
    #[arg(short, long)]
    id: ReplicaId,

    /// Client API port open to clients.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// List of replica p2p addresses, the order of which maps to replica
    /// IDs. Example: '-r host0:port0 -r host1:port1 -r host2:port2'.
    #[arg(short, long)]
    replicas: Vec<SocketAddr>,

    /// Replica configuration in TOML format.
    /// Example: '--config lease_ms=2000 applier="queue"'.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(CanopyError)` on any error.
    fn sanitize(&self) -> Result<(), CanopyError> {
        // check for duplicate peers
        let mut replicas_set = HashSet::new();
        for addr in self.replicas.iter() {
            if replicas_set.contains(addr) {
                return Err(CanopyError(format!(
                    "duplicate replica address '{}' given",
                    addr
                )));
            }
            replicas_set.insert(addr);
        }

        if (self.id as usize) >= self.replicas.len() {
            return Err(CanopyError(format!(
                "invalid replica ID {} / {}",
                self.id,
                self.replicas.len()
            )));
        }

        if self.api_port <= 1024 {
            Err(CanopyError(format!("invalid api_port {}", self.api_port)))
        } else if self.threads < 2 {
            Err(CanopyError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), CanopyError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let api_addr: SocketAddr = format!("127.0.0.1:{}", args.api_port)
        .parse()
        .map_err(|e| {
            CanopyError(format!(
                "failed to parse api_addr: port {}: {}",
                args.api_port, e
            ))
        })?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-replica{}", args.id))
        .build()?;

    // enter tokio runtime, set up the replica, and start the main event
    // loop logic
    runtime.block_on(async move {
        let mut replica = VrReplica::new_and_setup(
            args.id,
            api_addr,
            args.replicas,
            args.config.as_deref(),
        )
        .await?;

        replica.run().await;

        Ok::<(), CanopyError>(()) // give type hint for this async closure
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exited: {}", e);
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), CanopyError> {
        let args = CliArgs {
            id: 1,
            api_port: 52701,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52801".parse()?,
                "127.0.0.1:52802".parse()?,
            ],
            config: None,
            threads: 2,
        };
        args.sanitize()
    }

    #[test]
    fn sanitize_invalid_api_port() -> Result<(), CanopyError> {
        let args = CliArgs {
            id: 0,
            api_port: 1023,
            replicas: vec!["127.0.0.1:52800".parse()?],
            config: None,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_duplicate_replica() -> Result<(), CanopyError> {
        let args = CliArgs {
            id: 0,
            api_port: 52700,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52800".parse()?,
            ],
            config: None,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_id() -> Result<(), CanopyError> {
        let args = CliArgs {
            id: 3,
            api_port: 52700,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52801".parse()?,
                "127.0.0.1:52802".parse()?,
            ],
            config: None,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), CanopyError> {
        let args = CliArgs {
            id: 0,
            api_port: 52700,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52801".parse()?,
                "127.0.0.1:52802".parse()?,
            ],
            config: None,
            threads: 1,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}

//! Canopy interactive client executable: a small REPL over the client
//! library, useful for poking at a running replica group.

use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

use canopy::{CanopyClient, CanopyError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// List of server client API addresses, the order of which maps to
    /// replica IDs.
    #[arg(short, long)]
    servers: Vec<SocketAddr>,

    /// Per-call timeout in millisecs.
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,
}

/// Prints the REPL help message.
fn print_help() {
    println!("Commands:");
    println!("  create <path> <value>   set <path> <value>   get <path>");
    println!("  delete <path>           children <path>      stat <path>");
    println!("  sha256");
    println!("  push <value>   pop   done <id>   len   leninp   snapshot");
    println!("  help   exit");
}

/// Runs one REPL command line; returns false when the session should end.
async fn run_command(
    client: &mut CanopyClient,
    line: &str,
) -> Result<bool, CanopyError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [] => {}
        ["help"] => print_help(),
        ["exit"] | ["quit"] => return Ok(false),

        ["create", path, value] => {
            let node = client.create(path, value).await?;
            println!("node {:?}", node);
        }
        ["set", path, value] => {
            let node = client.set_data(path, value).await?;
            println!("node {:?}", node);
        }
        ["get", path] => {
            let node = client.get_data(path).await?;
            println!("node {:?}", node);
        }
        ["delete", path] => {
            client.delete(path).await?;
            println!("deleted");
        }
        ["children", path] => {
            let children = client.children(path).await?;
            println!("children {:?}", children);
        }
        ["stat", path] => {
            let stats = client.stats(path).await?;
            println!("stats {:?}", stats);
        }
        ["sha256"] => {
            let digest = client.tree_digest().await?;
            println!("digest {}", digest);
        }

        ["push", value] => {
            client.push(value).await?;
            println!("pushed");
        }
        ["pop"] => {
            let msg = client.pop().await?;
            println!("message {:?}", msg);
        }
        ["done", id] => {
            let id = id
                .parse::<u64>()
                .map_err(|e| CanopyError(format!("invalid id: {}", e)))?;
            client.done(id).await?;
            println!("done");
        }
        ["len"] => {
            println!("len {}", client.queue_len().await?);
        }
        ["leninp"] => {
            println!("in progress {}", client.in_progress_len().await?);
        }
        ["snapshot"] => {
            let (data, index) = client.snapshot().await?;
            println!("snapshot of {} bytes @ commit {}", data.len(), index);
        }

        _ => {
            println!("unrecognized command: '{}'", line);
            print_help();
        }
    }
    Ok(true)
}

// Client executable main entrance.
async fn client_main(args: CliArgs) -> Result<(), CanopyError> {
    let mut client = CanopyClient::new(args.servers);
    client.set_timeout(tokio::time::Duration::from_millis(args.timeout_ms));
    client.connect().await?;

    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();
    loop {
        stdout.write_all(b">>> ").await?;
        stdout.flush().await?;
        match lines.next_line().await? {
            Some(line) => match run_command(&mut client, &line).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("error: {}", e),
            },
            None => break, // stdin closed
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    let args = CliArgs::parse();
    if args.servers.is_empty() {
        eprintln!("no server addresses given");
        return;
    }

    if let Err(e) = client_main(args).await {
        eprintln!("client_main exited: {}", e);
    }
}

//! `daq-client`: command-line access to a running master.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use daq_master::codec::Value;
use daq_master::rpc::RpcClient;
use daq_master::sync_struct::Subscriber;
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "daq-client", version, about = "Control a DAQ master")]
struct Cli {
    /// Host running the master
    #[arg(long, default_value = "127.0.0.1")]
    server: String,

    /// Port of the state publisher
    #[arg(long = "port-notify", default_value_t = 3250)]
    port_notify: u16,

    /// Port of the RPC server
    #[arg(long = "port-control", default_value_t = 3251)]
    port_control: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit an experiment file as a run
    Submit {
        /// Repeat the run every this many seconds
        #[arg(long)]
        periodic: Option<f64>,

        /// Abort the run after this many seconds
        #[arg(long)]
        timeout: Option<f64>,

        /// Experiment argument as name=json, e.g. --arg steps=10
        #[arg(long = "arg", value_name = "NAME=JSON")]
        args: Vec<String>,

        /// Experiment file
        file: String,
    },
    /// Cancel a queued run, or a periodic run with --periodic
    Cancel {
        #[arg(long)]
        periodic: bool,
        id: u64,
    },
    /// Print the queued runs
    ShowQueue {
        /// Keep printing as the queue changes
        #[arg(long)]
        follow: bool,
    },
    /// Print the periodic runs
    ShowPeriodic {
        #[arg(long)]
        follow: bool,
    },
    /// Print the parameter database
    ShowParams {
        #[arg(long)]
        follow: bool,
    },
    /// Print recently finished runs
    ShowHistory,
    /// Set a parameter to a JSON value
    SetParam { name: String, value: String },
    /// Delete a parameter
    DelParam { name: String },
}

fn parse_json(text: &str) -> Result<Value> {
    let json: serde_json::Value =
        serde_json::from_str(text).with_context(|| format!("'{}' is not valid JSON", text))?;
    Ok(Value::from(json))
}

fn run_params(file: String, args: &[String]) -> Result<Value> {
    let mut arguments = Vec::new();
    for arg in args {
        let (name, json) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("argument '{}' is not NAME=JSON", arg))?;
        arguments.push((name.to_string(), parse_json(json)?));
    }
    Ok(Value::map([
        ("file", Value::from(file)),
        ("arguments", Value::map(arguments)),
    ]))
}

fn seconds(value: &Value) -> String {
    match value.as_float() {
        Some(secs) => format!("{:.1}s", secs),
        None => "-".to_string(),
    }
}

fn timestamp(value: &Value) -> String {
    value
        .as_float()
        .and_then(|secs| chrono::DateTime::from_timestamp_micros((secs * 1e6) as i64))
        .map(|at| at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_queue(queue: &Value) {
    let runs = queue.as_seq().unwrap_or_default();
    if runs.is_empty() {
        println!("Queue is empty");
        return;
    }
    println!("{:>6}  {:>9}  RUN PARAMETERS", "RID", "TIMEOUT");
    for run in runs {
        let fields = run.as_seq().unwrap_or_default();
        let field = |i: usize| fields.get(i).cloned().unwrap_or(Value::Null);
        println!("{:>6}  {:>9}  {}", field(0), seconds(&field(2)), field(1));
    }
}

fn print_periodic(periodic: &Value) {
    let Some(entries) = periodic.as_map().filter(|map| !map.is_empty()) else {
        println!("No periodic runs");
        return;
    };
    println!(
        "{:>5}  {:<19}  {:>9}  {:>9}  RUN PARAMETERS",
        "PRID", "NEXT RUN", "PERIOD", "TIMEOUT"
    );
    for (prid, entry) in entries {
        let fields = entry.as_seq().unwrap_or_default();
        let field = |i: usize| fields.get(i).cloned().unwrap_or(Value::Null);
        println!(
            "{:>5}  {:<19}  {:>9}  {:>9}  {}",
            prid,
            timestamp(&field(0)),
            seconds(&field(3)),
            seconds(&field(2)),
            field(1)
        );
    }
}

fn print_params(params: &Value) {
    let Some(entries) = params.as_map().filter(|map| !map.is_empty()) else {
        println!("No parameters");
        return;
    };
    for (name, value) in entries {
        let name = name.as_str().map_or_else(|| name.to_string(), String::from);
        println!("{} = {}", name, value);
    }
}

fn print_history(history: &Value) {
    let records = history.as_seq().unwrap_or_default();
    if records.is_empty() {
        println!("No finished runs");
        return;
    }
    for record in records {
        let get = |key: &str| record.get(key).cloned().unwrap_or(Value::Null);
        let message = get("message");
        println!(
            "{} {:<8} {:>4}  {:<13}  {}{}",
            timestamp(&get("finished")),
            get("origin").as_str().unwrap_or("?"),
            get("id"),
            get("status").as_str().unwrap_or("?"),
            get("run_params"),
            message
                .as_str()
                .map(|m| format!("  ({})", m))
                .unwrap_or_default()
        );
    }
}

async fn show(cli: &Cli, store: &str, follow: bool, print: fn(&Value)) -> Result<()> {
    let addr = format!("{}:{}", cli.server, cli.port_notify);
    let mut subscriber = Subscriber::connect(addr.as_str(), store, |value| value)
        .await
        .with_context(|| format!("Failed to subscribe to '{}' at {}", store, addr))?;
    print(subscriber.replica());
    if follow {
        subscriber
            .run(|replica, _event| {
                println!();
                print(replica);
            })
            .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();
    let mut rpc = RpcClient::new(format!("{}:{}", cli.server, cli.port_control));

    match &cli.command {
        Command::Submit {
            periodic,
            timeout,
            args,
            file,
        } => {
            let params = run_params(file.clone(), args)?;
            let timeout = Value::from(*timeout);
            match periodic {
                Some(period) => {
                    let prid = rpc
                        .call_positional(
                            "run_periodic",
                            vec![params, timeout, Value::Float(*period)],
                        )
                        .await?;
                    println!("PRID: {}", prid);
                }
                None => {
                    let rid = rpc.call_positional("run_once", vec![params, timeout]).await?;
                    println!("RID: {}", rid);
                }
            }
        }
        Command::Cancel { periodic, id } => {
            let method = if *periodic { "cancel_periodic" } else { "cancel_once" };
            rpc.call_positional(method, vec![Value::from(*id)]).await?;
        }
        Command::ShowQueue { follow } => show(&cli, "queue", *follow, print_queue).await?,
        Command::ShowPeriodic { follow } => {
            show(&cli, "periodic", *follow, print_periodic).await?
        }
        Command::ShowParams { follow } => show(&cli, "parameters", *follow, print_params).await?,
        Command::ShowHistory => {
            let history = rpc.call_positional("get_history", Vec::new()).await?;
            print_history(&history);
        }
        Command::SetParam { name, value } => {
            let value = parse_json(value)?;
            rpc.call(
                "pdb_set",
                vec![Value::from(name.as_str()), value],
                BTreeMap::new(),
            )
            .await?;
        }
        Command::DelParam { name } => {
            rpc.call_positional("pdb_delete", vec![Value::from(name.as_str())])
                .await?;
        }
    }
    rpc.close();
    Ok(())
}

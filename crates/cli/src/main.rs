use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use nimbus_api::{Config, ControlPlane, FleetOps, SecurityGroupReq, SpecReq, SubnetReq};
use nimbus_core::{FilterCriteria, ResourceKind, ResourceRecord};
use nimbus_store::WatchKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "nimbusctl", version, about = "Nimbus resource registry CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to operate in
    #[arg(long = "ns", global = true, env = "NIMBUS_NS", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print one record
    Get {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
        id: String,
    },
    /// List records of a kind
    List {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
    },
    Delete {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
        id: String,
    },
    /// Rewrite the query mirror for a kind from the canonical store
    RebuildMirror {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
    },
    /// Security groups
    Sg {
        #[command(subcommand)]
        cmd: SgCmd,
    },
    /// VM specs
    Spec {
        #[command(subcommand)]
        cmd: SpecCmd,
    },
    Subnet {
        #[command(subcommand)]
        cmd: SubnetCmd,
    },
    /// Operations across the VMs of a group
    Fleet {
        #[command(subcommand)]
        cmd: FleetCmd,
    },
    /// Print +/- events for records of a kind until Ctrl-C
    Watch {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
    },
}

#[derive(Subcommand, Debug)]
enum SgCmd {
    /// Create from a JSON request file
    Create { file: PathBuf },
    /// Import an existing CSP security group
    Register { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum SpecCmd {
    /// Register from a JSON file: a {name, connectionName, cspSpecName} request,
    /// or a full record with --with-info
    Register {
        file: PathBuf,
        #[arg(long = "with-info", action = ArgAction::SetTrue)]
        with_info: bool,
        /// Overwrite an existing record
        #[arg(long = "update", action = ArgAction::SetTrue)]
        update: bool,
    },
    /// Pull specs from the driver for one connection, or all when omitted
    Fetch {
        #[arg(long = "conn")]
        connection: Option<String>,
    },
    /// Filter by JSON criteria (e.g. {"vCPU": {"min": 2, "max": 8}})
    Filter {
        /// Criteria file; match everything when omitted
        file: Option<PathBuf>,
        #[arg(long = "order-by")]
        order_by: Option<String>,
        #[arg(long = "direction", default_value = "ascending")]
        direction: String,
    },
    /// Merge the JSON object in `file` into a spec
    Update { id: String, file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum SubnetCmd {
    Create {
        #[arg(long = "vnet")]
        vnet: String,
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum FleetCmd {
    /// Install the monitoring agent on every eligible VM of a group
    InstallAgent {
        group: String,
        #[arg(long = "user", default_value = "")]
        user: String,
        #[arg(long = "service-type", default_value = "")]
        service_type: String,
    },
    /// Poll one metric (cpu, mem, disk, net, ...) from every VM of a group
    Monitor { group: String, metric: String },
    /// Override the agent status of one VM
    SetStatus { vm: String, status: String },
    /// Probe the monitoring service
    Ping,
}

fn parse_kind(s: &str) -> Result<ResourceKind, String> {
    ResourceKind::from_str(s).map_err(|e| e.to_string())
}

fn init_tracing() {
    let env = std::env::var("NIMBUS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NIMBUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid NIMBUS_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_records(output: Output, recs: &[ResourceRecord]) -> Result<()> {
    match output {
        Output::Json => print_json(&recs),
        Output::Human => {
            println!("{:<6} {:<28} {:<20} {:<16} CSP-ID", "ORDER", "ID", "NAME", "CONNECTION");
            for r in recs {
                let order = r.order_in_filtered_result().map(|o| o.to_string()).unwrap_or_else(|| "-".into());
                println!("{:<6} {:<28} {:<20} {:<16} {}", order, r.id, r.name, r.connection_name, r.csp.system_id);
            }
            Ok(())
        }
    }
}

fn print_record(output: Output, rec: &ResourceRecord) -> Result<()> {
    match output {
        Output::Json => print_json(rec),
        Output::Human => print_records(output, std::slice::from_ref(rec)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = Config::from_env();
    let cp = ControlPlane::open(&cfg).await?;
    let ns = cli.namespace.as_str();
    let out = cli.output;

    match cli.command {
        Commands::Get { kind, id } => print_record(out, &cp.registry().get(ns, kind, &id).await?)?,
        Commands::List { kind } => print_records(out, &cp.registry().list(ns, kind).await?)?,
        Commands::Delete { kind, id } => {
            cp.registry().delete(ns, kind, &id).await?;
            println!("deleted {}/{}/{}", ns, kind, id);
        }
        Commands::RebuildMirror { kind } => {
            let n = cp.registry().rebuild_mirror(ns, kind).await?;
            println!("mirror rows for {}/{}: {}", ns, kind, n);
        }
        Commands::Sg { cmd } => {
            let rec = match cmd {
                SgCmd::Create { file } => cp.security_groups().create(ns, &read_json::<SecurityGroupReq>(&file)?).await?,
                SgCmd::Register { file } => cp.security_groups().register(ns, &read_json::<SecurityGroupReq>(&file)?).await?,
            };
            print_record(out, &rec)?;
        }
        Commands::Spec { cmd } => match cmd {
            SpecCmd::Register { file, with_info, update } => {
                let rec = if with_info {
                    cp.specs().register_with_info(ns, read_json::<ResourceRecord>(&file)?, update).await?
                } else {
                    cp.specs().register_with_csp_spec_name(ns, &read_json::<SpecReq>(&file)?, update).await?
                };
                print_record(out, &rec)?;
            }
            SpecCmd::Fetch { connection } => match connection {
                Some(conn) => {
                    let n = cp.specs().fetch_for_connection(ns, &conn).await?;
                    println!("registered {} specs from {}", n, conn);
                }
                None => {
                    let (conns, specs) = cp.specs().fetch_for_all_connections(ns).await?;
                    println!("registered {} specs from {} connections", specs, conns);
                }
            },
            SpecCmd::Filter { file, order_by, direction } => {
                let criteria: FilterCriteria = match file {
                    Some(f) => read_json(&f)?,
                    None => FilterCriteria::default(),
                };
                let recs = match order_by {
                    Some(field) => cp.specs().filter_sorted(ns, &criteria, &field, &direction).await?,
                    None => cp.specs().filter(ns, &criteria).await?,
                };
                print_records(out, &recs)?;
            }
            SpecCmd::Update { id, file } => {
                let partial: Map<String, Value> = read_json(&file)?;
                print_record(out, &cp.specs().update(ns, &id, &partial).await?)?;
            }
        },
        Commands::Subnet { cmd: SubnetCmd::Create { vnet, file } } => {
            let rec = cp.subnets().create(ns, &vnet, &read_json::<SubnetReq>(&file)?).await?;
            print_record(out, &rec)?;
        }
        Commands::Fleet { cmd } => {
            let fleet = cp.fleet();
            match cmd {
                FleetCmd::InstallAgent { group, user, service_type } => {
                    let agg = fleet.install_agent(ns, &group, &user, &service_type).await?;
                    match out {
                        Output::Json => print_json(&agg)?,
                        Output::Human => {
                            println!("{:<20} {:<16} RESULT", "VM", "IP");
                            for e in &agg.entries {
                                let res = e.error.clone().unwrap_or_else(|| "ok".into());
                                println!("{:<20} {:<16} {}", e.member_id, e.ip, res);
                            }
                            for id in &agg.skipped {
                                println!("{:<20} {:<16} skipped", id, "");
                            }
                        }
                    }
                }
                FleetCmd::Monitor { group, metric } => {
                    let report = fleet.get_monitoring_data(ns, &group, &metric).await?;
                    match out {
                        Output::Json => print_json(&report)?,
                        Output::Human => {
                            println!("{:<20} {:<8} VALUE", "VM", "METRIC");
                            for s in &report.samples {
                                let v = if s.err.is_empty() { s.value.to_string() } else { format!("error: {}", s.err) };
                                println!("{:<20} {:<8} {}", s.vm_id, s.metric, v);
                            }
                        }
                    }
                }
                FleetCmd::SetStatus { vm, status } => {
                    fleet.set_agent_status(ns, &vm, &status).await?;
                    println!("{} monAgentStatus={}", vm, status);
                }
                FleetCmd::Ping => print_json(&fleet.check_monitoring_endpoint().await?)?,
            }
        }
        Commands::Watch { kind } => {
            info!(ns = %ns, kind = %kind, "watch invoked");
            let mut rx = cp.watch(ns, kind).await?;
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(ev) => match (out, ev.kind) {
                            (Output::Json, _) => println!("{}", serde_json::to_string(&ev)?),
                            (Output::Human, WatchKind::Put) => println!("+ {}", ev.key),
                            (Output::Human, WatchKind::Delete) => println!("- {}", ev.key),
                        },
                        None => {
                            warn!("watch channel closed; exiting watch loop");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

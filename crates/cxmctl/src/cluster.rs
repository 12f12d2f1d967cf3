//! Cluster subcommands: state inspection and operator actions, all sent to
//! the local daemon.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tabled::{Table, Tabled};

use cxm_proto::cluster::{CoordinatorDump, MemberStatus, Migration, Mode, Role, StateInfo};
use cxm_proto::error::{CxmError, CxmResult};
use cxm_proto::rpc::{LocalRequest, Response};

use crate::common::{format_age, format_time, request};

// ---------------------------------------------------------------------------
// Table display types
// ---------------------------------------------------------------------------

#[derive(Tabled, Debug, PartialEq)]
struct MemberRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Last heartbeat")]
    last_heartbeat: String,
    #[tabled(rename = "Clock offset")]
    clock_offset: i64,
    #[tabled(rename = "VMs")]
    vms: usize,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled)]
struct MigrationRow {
    #[tabled(rename = "#")]
    step: usize,
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "From")]
    from: String,
    #[tabled(rename = "To")]
    to: String,
}

fn member_rows(dump: &CoordinatorDump, now: i64) -> Vec<MemberRow> {
    let members: &MemberStatus = &dump.members;
    members
        .values()
        .map(|m| {
            let status = if dump.recovering.contains(&m.name) {
                "recovering"
            } else if dump.state.leader.as_deref() == Some(m.name.as_str()) {
                "master"
            } else {
                "ok"
            };
            MemberRow {
                name: m.name.clone(),
                last_heartbeat: format_age(now, m.last_net_timestamp),
                clock_offset: m.clock_offset,
                vms: m.running_vms.len(),
                status: status.to_string(),
            }
        })
        .collect()
}

fn migration_rows(plan: &[Migration]) -> Vec<MigrationRow> {
    plan.iter()
        .enumerate()
        .map(|(i, m)| MigrationRow {
            step: i + 1,
            vm: m.vm.clone(),
            from: m.from.clone(),
            to: m.to.clone(),
        })
        .collect()
}

fn unexpected(resp: Response) -> CxmError {
    CxmError::Malformed(format!("unexpected response {:?}", resp))
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

pub async fn ping(socket: &Path) -> CxmResult<()> {
    match request(socket, LocalRequest::Ping).await? {
        Response::Pong => {
            println!("cxmd is running");
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

async fn state(socket: &Path) -> CxmResult<StateInfo> {
    match request(socket, LocalRequest::GetState).await? {
        Response::State(state) => Ok(state),
        other => Err(unexpected(other)),
    }
}

pub async fn status(socket: &Path) -> CxmResult<()> {
    let state = state(socket).await?;
    println!("Role:          {}", state.role);
    println!("Mode:          {}", state.mode);
    println!(
        "Master:        {}",
        state.leader.as_deref().unwrap_or("-")
    );
    println!(
        "Last election: {}",
        format_time(state.last_election_at.unwrap_or(0))
    );
    Ok(())
}

pub async fn dump(socket: &Path, json: bool) -> CxmResult<()> {
    let dump = match request(socket, LocalRequest::GetDump).await? {
        Response::Dump(dump) => dump,
        other => return Err(unexpected(other)),
    };

    if json {
        let text = serde_json::to_string_pretty(&dump)
            .map_err(|e| CxmError::Malformed(e.to_string()))?;
        println!("{}", text);
        return Ok(());
    }

    println!("Node {} in cluster {}", dump.node, dump.cluster);
    println!(
        "Role {}, mode {}, master {}",
        dump.state.role,
        dump.state.mode,
        dump.state.leader.as_deref().unwrap_or("-")
    );
    println!("Master last seen: {}", format_time(dump.last_leader_seen_at));
    if let Some(election) = dump.current_election {
        println!("Election {} ({} ballot(s))", election, dump.ballots.len());
    }
    println!();
    println!("{}", Table::new(member_rows(&dump, now())));
    Ok(())
}

pub async fn nodes(socket: &Path) -> CxmResult<()> {
    match request(socket, LocalRequest::ListNodes).await? {
        Response::Nodes(nodes) => {
            for node in nodes {
                println!("{}", node);
            }
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

/// Operator actions answered with a bare `Ok`.
pub async fn action(socket: &Path, req: LocalRequest, done: &str) -> CxmResult<()> {
    match request(socket, req).await? {
        Response::Ok => {
            println!("{}", done);
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

pub async fn balance(socket: &Path, dry_run: bool) -> CxmResult<()> {
    match request(socket, LocalRequest::Balance { dry_run }).await? {
        Response::Plan(None) => {
            println!("Current placement is already balanced");
            Ok(())
        }
        Response::Plan(Some(plan)) => {
            println!("{}", Table::new(migration_rows(&plan)));
            if dry_run {
                println!("Dry run, nothing migrated");
            } else {
                println!("{} migration(s) started", plan.len());
            }
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

/// Leaving while the master recovers a node would stop the recovery.
fn check_quit(state: &StateInfo, force: bool) -> CxmResult<()> {
    if !force && state.role == Role::Active && state.mode == Mode::Recovery {
        return Err(CxmError::InvalidParms(
            "this node is the master and a recovery is running, use --force".into(),
        ));
    }
    Ok(())
}

pub async fn quit(socket: &Path, force: bool) -> CxmResult<()> {
    let state = state(socket).await?;
    check_quit(&state, force)?;
    action(socket, LocalRequest::Quit, "cxmd is leaving the cluster").await
}

//! End-to-end scenarios run over the in-memory `Cluster` harness: happy
//! path, relay failure, ballot pre-emption, gap recovery, ballot tie, and
//! log cleanup.

use std::time::Duration;

use pigpaxos_core::command::{Command, CommandId};
use pigpaxos_core::id::Id;
use pigpaxos_core::replica::Submission;
use pigpaxos_testkit::{Cluster, FaultMode};

fn ids(pairs: &[(u16, u16)]) -> Vec<Id> {
    pairs.iter().map(|&(z, n)| Id::new(z, n)).collect()
}

async fn submit_and_wait(cluster: &Cluster, at: Id, command: Command) {
    match cluster.submit(at, command).await {
        Submission::Pending(rx) => {
            let reply = tokio::time::timeout(Duration::from_secs(2), rx).await;
            assert!(reply.is_ok(), "command did not commit within the timeout");
        }
        Submission::Read(_) => {}
        Submission::Forwarded => {}
    }
}

#[tokio::test]
async fn happy_path_commits_a_write_and_serves_a_read() {
    let members = ids(&[(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]);
    let cluster = Cluster::build(members.clone(), 2);
    let client = members[0];

    submit_and_wait(&cluster, client, Command::put(CommandId { client, seq: 1 }, "a", "1")).await;

    match cluster.submit(client, Command::get(CommandId { client, seq: 2 }, "a")).await {
        Submission::Read(reply) => assert_eq!(reply.value, "1"),
        Submission::Pending(rx) => {
            let reply = tokio::time::timeout(Duration::from_secs(2), rx).await.expect("read timed out");
            assert_eq!(reply.unwrap().value, "1");
        }
        Submission::Forwarded => panic!("read forwarded instead of answered"),
    }
    cluster.shutdown();
}

#[tokio::test]
async fn write_still_commits_when_one_relay_is_crashed() {
    let members = ids(&[(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]);
    let cluster = Cluster::build(members.clone(), 2);
    let client = members[0];

    // Every node's send to (2, 2) is dropped, forcing the relay-selection
    // policy to route around it for the home group it belongs to.
    for &from in &members {
        cluster.set_fault(from, Id::new(2, 2), FaultMode::Drop);
    }

    submit_and_wait(&cluster, client, Command::put(CommandId { client, seq: 1 }, "b", "2")).await;
    cluster.shutdown();
}

#[tokio::test]
async fn second_writer_preempts_the_first_ballot() {
    let members = ids(&[(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]);
    let cluster = Cluster::build(members.clone(), 2);
    let first = members[0];
    let second = members[3];

    submit_and_wait(&cluster, first, Command::put(CommandId { client: first, seq: 1 }, "c", "3")).await;
    // A write from a different node's ballot owner should still land once
    // the new leader's phase-1/phase-2 rounds settle.
    submit_and_wait(&cluster, second, Command::put(CommandId { client: second, seq: 1 }, "c", "4")).await;
    cluster.shutdown();
}

#[tokio::test]
async fn a_slow_follower_catches_up_via_recovery() {
    let members = ids(&[(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]);
    let cluster = Cluster::build(members.clone(), 2);
    let client = members[0];
    let straggler = members[5];

    cluster.set_fault(client, straggler, FaultMode::Drop);
    submit_and_wait(&cluster, client, Command::put(CommandId { client, seq: 1 }, "d", "5")).await;

    // Clear the fault so the straggler's recovery request for the
    // committed-but-missed slot can be answered normally.
    cluster.set_fault(client, straggler, FaultMode::Clear);
    tokio::time::sleep(Duration::from_millis(200)).await;
    cluster.shutdown();
}

#[tokio::test]
async fn concurrent_writers_resolve_without_deadlock() {
    let members = ids(&[(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]);
    let cluster = Cluster::build(members.clone(), 2);

    let mut pending = Vec::new();
    for (i, &node) in members.iter().enumerate() {
        pending.push(cluster.submit(node, Command::put(CommandId { client: node, seq: 1 }, "e", &(i + 1).to_string())).await);
    }
    for submission in pending {
        if let Submission::Pending(rx) = submission {
            let _ = tokio::time::timeout(Duration::from_secs(2), rx).await;
        }
    }
    cluster.shutdown();
}

#[tokio::test]
async fn many_writes_still_commit_under_routine_cleanup() {
    let members = ids(&[(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]);
    let cluster = Cluster::build(members.clone(), 2);
    let client = members[0];

    for seq in 1..=20u64 {
        submit_and_wait(&cluster, client, Command::put(CommandId { client, seq }, "f", &seq.to_string())).await;
    }
    cluster.shutdown();
}

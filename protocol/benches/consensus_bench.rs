// Consensus engine benchmarks.
//
// Covers proposal creation, single vote processing and a full three-phase
// round driven through an in-memory message queue.

use std::collections::{HashSet, VecDeque};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use trellis_protocol::network::{
    ConsensusAction, ConsensusEngine, ConsensusVote, Message, VotePhase,
};

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("n{i}")).collect()
}

fn members_of(ids: &[String], of: &str) -> HashSet<String> {
    ids.iter().filter(|id| *id != of).cloned().collect()
}

/// Runs one proposal from `n0` to execution on every engine.
fn full_round(ids: &[String], engines: &[ConsensusEngine]) {
    let mut queue: VecDeque<(usize, usize, Message)> = VecDeque::new();
    let broadcast = |queue: &mut VecDeque<(usize, usize, Message)>, from: usize, msg: Message| {
        for to in 0..ids.len() {
            if to != from {
                queue.push_back((from, to, msg.clone()));
            }
        }
    };
    let push_actions = |queue: &mut VecDeque<(usize, usize, Message)>, from: usize, actions: Vec<ConsensusAction>| {
        for action in actions {
            if let ConsensusAction::Broadcast(msg) = action {
                broadcast(queue, from, msg);
            }
        }
    };

    let (pp, _decided) = engines[0]
        .begin_proposal(json!({ "op": "bench" }))
        .expect("proposal");
    let actions = engines[0]
        .handle_pre_prepare(&ids[0], pp.clone(), &members_of(ids, &ids[0]), 0)
        .expect("pre-prepare");
    broadcast(&mut queue, 0, Message::ConsensusProposal(pp));
    push_actions(&mut queue, 0, actions);

    while let Some((from, to, msg)) = queue.pop_front() {
        let members = members_of(ids, &ids[to]);
        let result = match msg {
            Message::ConsensusProposal(pp) => engines[to].handle_pre_prepare(&ids[from], pp, &members, 0),
            Message::ConsensusVote(vote) => engines[to].handle_vote(&ids[from], vote, &members, 0),
            _ => Ok(Vec::new()),
        };
        if let Ok(actions) = result {
            push_actions(&mut queue, to, actions);
        }
    }
}

fn bench_begin_proposal(c: &mut Criterion) {
    let engine = ConsensusEngine::new("n0");
    c.bench_function("consensus/begin_proposal", |b| {
        b.iter(|| engine.begin_proposal(json!({ "op": "bench" })));
    });
}

fn bench_vote_processing(c: &mut Criterion) {
    let ids = ids(10);
    let members = members_of(&ids, "n0");

    c.bench_function("consensus/handle_prepare_vote", |b| {
        b.iter_batched(
            || {
                let engine = ConsensusEngine::new("n0");
                let (pp, _) = engine.begin_proposal(json!({ "op": "bench" })).expect("proposal");
                engine
                    .handle_pre_prepare("n0", pp.clone(), &members, 0)
                    .expect("pre-prepare");
                let vote = ConsensusVote {
                    proposal_id: pp.proposal_id,
                    phase: VotePhase::Prepare,
                    view: pp.view,
                    sequence: pp.sequence,
                };
                (engine, vote)
            },
            |(engine, vote)| engine.handle_vote("n1", vote, &members, 0),
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_full_round(c: &mut Criterion) {
    let mut group = c.benchmark_group("consensus/full_round");
    for size in [4, 7, 10] {
        let ids = ids(size);
        // Messages per round: one pre-prepare plus two vote phases.
        group.throughput(Throughput::Elements((size * (size - 1) * 3) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &ids, |b, ids| {
            b.iter_batched(
                || ids.iter().map(|id| ConsensusEngine::new(id.clone())).collect::<Vec<_>>(),
                |engines| full_round(ids, &engines),
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_begin_proposal,
    bench_vote_processing,
    bench_full_round,
);
criterion_main!(benches);

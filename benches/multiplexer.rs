//! Performance benchmarks for a3s-acp
//!
//! Run with: cargo bench

use a3s_acp::protocol::JsonRpcMessage;
use a3s_acp::{Origin, StreamMultiplexer, TemplateStore};
use criterion::{criterion_group, criterion_main, Criterion};
use std::collections::HashMap;

fn bench_multiplexer_interleave(c: &mut Criterion) {
    let mut group = c.benchmark_group("mux_interleave");
    for origins in [1, 4, 16] {
        group.bench_function(format!("{} origins x 100 chunks", origins), |b| {
            b.iter(|| {
                let (mux, mut rx) = StreamMultiplexer::new();
                let senders: Vec<_> = (0..origins)
                    .map(|i| mux.open(Origin::ToolCall(format!("call_{}", i))).unwrap())
                    .collect();
                for chunk in 0..100 {
                    for sender in &senders {
                        sender.output(format!("line {}", chunk)).unwrap();
                    }
                }
                drop(senders);
                let mut count = 0;
                while rx.try_recv().is_ok() {
                    count += 1;
                }
                count
            });
        });
    }
    group.finish();
}

fn bench_message_parse(c: &mut Criterion) {
    let prompt = serde_json::to_vec(&serde_json::json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "session/prompt",
        "params": {
            "sessionId": "5f0c1c9e-3d2a-4a57-9a53-1b8c2f1d0e11",
            "prompt": [{"type": "text", "text": "Fix the failing test in src/lib.rs"}]
        }
    }))
    .unwrap();

    c.bench_function("JsonRpcMessage::parse (request)", |b| {
        b.iter(|| JsonRpcMessage::parse(&prompt).unwrap());
    });

    let message = JsonRpcMessage::parse(&prompt).unwrap();
    c.bench_function("JsonRpcMessage::to_bytes", |b| {
        b.iter(|| message.to_bytes().unwrap());
    });
}

fn bench_template_render(c: &mut Criterion) {
    let store = TemplateStore::builtin();
    let values: HashMap<String, String> = [
        ("cwd", "/work/project"),
        ("mode", "approval_required"),
        ("tools", "- read_file\n- write_file\n- run_cmd"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    c.bench_function("render system template", |b| {
        b.iter(|| store.render("system", &values).unwrap());
    });
}

criterion_group!(
    benches,
    bench_multiplexer_interleave,
    bench_message_parse,
    bench_template_render,
);
criterion_main!(benches);

//! Fuzz target for applying a batch of control events.
//!
//! Decodes every event as a control event and applies the ones that parse
//! to a small topology. Must never panic or leave a provider loop.

#![no_main]

use cascade_consumer::event::{Batch, Event};
use cascade_consumer::interpreter;
use cascade_consumer::{Node, NodeType, Topology};
use libfuzzer_sys::fuzz_target;

const KINDS: [&str; 8] = [
    "pgq.node-created",
    "pgq.node-dropped",
    "pgq.provider-switch",
    "pgq.member-update",
    "pgq.tag-switch",
    "pgq.pause",
    "pgq.resume",
    "pgq.watermark",
];

fuzz_target!(|data: Vec<(u8, &str)>| {
    let events = data
        .iter()
        .enumerate()
        .map(|(i, (kind, payload))| Event::new(i as u64, KINDS[*kind as usize % KINDS.len()], *payload))
        .collect();
    let batch = Batch {
        batch_id: 1,
        prev_tick: 0,
        tick: 1,
        events,
    };

    let mut topo = Topology::new("local");
    let _ = topo.upsert_node(Node::new("root", NodeType::Root));
    let _ = topo.upsert_node(Node::new("local", NodeType::Branch).with_provider("root"));

    for event in &batch.events {
        if let Ok(Some(control)) = cascade_consumer::ControlEvent::decode(event) {
            let _ = interpreter::apply(&control, &mut topo, "worker");
        }
    }
    let _ = interpreter::decode_batch(&batch);

    for node in topo.nodes() {
        let mut current = node.provider_node.clone();
        let mut steps = 0;
        while let Some(name) = current {
            assert!(name != node.node_name && steps <= topo.len(), "provider loop");
            steps += 1;
            current = topo.get_node(&name).and_then(|n| n.provider_node.clone());
        }
    }
});

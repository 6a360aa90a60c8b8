//! Property tests for the redistribution phase over random graphs.

use chrono::Utc;
use proptest::prelude::*;
use spread_rs::config::InvariantMode;
use spread_rs::entity::refresh_aggregates;
use spread_rs::phases::redistribution::redistribute;
use spread_rs::phases::InvariantGuard;
use spread_rs::working::WorkingGraph;
use spread_rs::{EngineConfig, GraphSnapshot, Link, LinkId, Node, NodeId};

/// (energy, threshold) per node and (source, target, weight) per link.
type Shape = (Vec<(f64, f64)>, Vec<(usize, usize, f64)>);

fn shape() -> impl Strategy<Value = Shape> {
    (2usize..8).prop_flat_map(|n| {
        (
            prop::collection::vec((0.0f64..20.0, 0.5f64..5.0), n),
            prop::collection::vec((0..n, 0..n, 0.1f64..3.0), 0..(n * 3)),
        )
    })
}

fn build((nodes, links): &Shape) -> WorkingGraph {
    WorkingGraph::from_snapshot(
        GraphSnapshot {
            nodes: nodes
                .iter()
                .enumerate()
                .map(|(i, (e, t))| Node::new(NodeId(i as u64 + 1), format!("n{i}")).with_energy(*e).with_threshold(*t))
                .collect(),
            links: links
                .iter()
                .enumerate()
                .map(|(i, (s, t, w))| {
                    Link::new(LinkId(i as u64 + 1), NodeId(*s as u64 + 1), NodeId(*t as u64 + 1), "r").with_weight(*w)
                })
                .collect(),
            ..GraphSnapshot::default()
        },
        Utc::now(),
    )
}

fn config(reverse: f64) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.invariant_mode = InvariantMode::Strict;
    cfg.diffusion.reverse_stride_factor = reverse;
    cfg
}

proptest! {
    #[test]
    fn prop_conserves_energy_without_decay(s in shape(), reverse in 0.0f64..1.0) {
        let mut g = build(&s);
        let cfg = config(reverse);
        let before = g.total_energy();
        let mut guard = InvariantGuard::new(cfg.invariant_mode);
        refresh_aggregates(&mut g, cfg.lifecycle.quality_discount);
        let out = redistribute(&mut g, &cfg, &mut guard).unwrap();
        prop_assert!((g.total_energy() - before).abs() <= 1e-9 * before.max(1.0));
        prop_assert!((out.energy_moved - out.energy_delivered).abs() <= 1e-12);
    }

    #[test]
    fn prop_energy_stays_non_negative(s in shape(), decay in 0.0f64..0.5, loss in 0.0f64..0.5) {
        let mut g = build(&s);
        let mut cfg = config(0.5);
        cfg.diffusion.node_decay = decay;
        cfg.diffusion.stride_loss = loss;
        let mut guard = InvariantGuard::new(cfg.invariant_mode);
        for _ in 0..5 {
            refresh_aggregates(&mut g, cfg.lifecycle.quality_discount);
            redistribute(&mut g, &cfg, &mut guard).unwrap();
            prop_assert!(g.nodes().all(|n| n.energy >= 0.0));
        }
    }

    #[test]
    fn prop_stride_never_exceeds_source(s in shape()) {
        let mut g = build(&s);
        let cfg = config(1.0);
        let mut guard = InvariantGuard::new(cfg.invariant_mode);
        refresh_aggregates(&mut g, cfg.lifecycle.quality_discount);
        let out = redistribute(&mut g, &cfg, &mut guard).unwrap();
        for stride in &out.strides {
            prop_assert!(stride.delta <= stride.source_energy);
            prop_assert!(stride.delivered <= stride.delta);
        }
        // Summed over a source's links, strides stay within its surplus.
        for id in g.node_ids() {
            let drawn: f64 = out.strides.iter().filter(|st| st.from == *id).map(|st| st.delta).sum();
            let first = out.strides.iter().find(|st| st.from == *id);
            if let Some(st) = first {
                prop_assert!(drawn <= st.source_energy + 1e-9);
            }
        }
    }

    #[test]
    fn prop_trace_emas_stay_in_unit_interval(s in shape()) {
        let mut g = build(&s);
        let cfg = config(0.3);
        let mut guard = InvariantGuard::new(cfg.invariant_mode);
        for _ in 0..20 {
            refresh_aggregates(&mut g, cfg.lifecycle.quality_discount);
            redistribute(&mut g, &cfg, &mut guard).unwrap();
        }
        for l in g.links() {
            prop_assert!((0.0..=1.0).contains(&l.trace.ema_active));
            for gate in l.trace.ema_hunger_gates.0 {
                prop_assert!((0.0..=1.0).contains(&gate));
            }
        }
    }

    #[test]
    fn prop_flip_precedence_sums_to_one(s in shape()) {
        let mut g = build(&s);
        let cfg = config(0.0);
        let mut guard = InvariantGuard::new(cfg.invariant_mode);
        refresh_aggregates(&mut g, cfg.lifecycle.quality_discount);
        let out = redistribute(&mut g, &cfg, &mut guard).unwrap();
        for f in &out.flips {
            if !f.contributors.is_empty() {
                let total: f64 = f.contributors.iter().map(|(_, pi)| pi).sum();
                prop_assert!((total - 1.0).abs() < 1e-9);
            }
        }
    }
}

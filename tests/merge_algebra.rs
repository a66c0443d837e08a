//! Merge algebra over whole configurations.
//!
//! Checks the per-field rules through the public builder and configuration
//! APIs: scalars (newer wins when present), sequences (concatenate),
//! mappings (key union, newer wins), flags (sticky OR), hooks (both run).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use dockyard::builder::{ContainerBuilder, NetworkBuilder};
use dockyard::configuration::{
    ContainerConfiguration, Mount, NetworkConfiguration, ResourceConfiguration,
};
use dockyard::modules::{Module, Postgres};
use dockyard::orchestrator::output::{OutputChunk, OutputConsumer, OutputStream};
use dockyard::wait::WaitStrategy;

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn sample() -> Vec<ContainerConfiguration> {
    vec![
        ContainerConfiguration::default(),
        ContainerConfiguration {
            image: Some("alpine:3".to_string()),
            command: vec!["sh".to_string()],
            env: env(&[("A", "1"), ("B", "1")]),
            privileged: true,
            ..Default::default()
        },
        ContainerConfiguration {
            name: Some("db".to_string()),
            command: vec!["-c".to_string(), "sh".to_string()],
            env: env(&[("B", "2")]),
            mounts: vec![Mount::tmpfs("/scratch")],
            auto_remove: true,
            ..Default::default()
        },
        ContainerConfiguration {
            image: Some("postgres:16".to_string()),
            env: env(&[("C", "3")]),
            ..Default::default()
        },
    ]
}

type View = (
    Option<String>,
    Option<String>,
    Vec<String>,
    BTreeMap<String, String>,
    Vec<Mount>,
    bool,
    bool,
);

/// Field-wise view that can be compared for equality.
fn view(c: &ContainerConfiguration) -> View {
    (
        c.image.clone(),
        c.name.clone(),
        c.command.clone(),
        c.env.clone(),
        c.mounts.clone(),
        c.auto_remove,
        c.privileged,
    )
}

// ── Per-field rules ─────────────────────────────────────────────────────────

#[test]
fn every_pair_follows_the_field_rules() {
    let configs = sample();
    for a in &configs {
        for b in &configs {
            let merged = a.merge(b);

            assert_eq!(merged.image, b.image.clone().or(a.image.clone()));
            assert_eq!(merged.name, b.name.clone().or(a.name.clone()));
            assert_eq!(merged.command, [a.command.clone(), b.command.clone()].concat());
            assert_eq!(merged.mounts, [a.mounts.clone(), b.mounts.clone()].concat());
            for (key, value) in &merged.env {
                assert_eq!(Some(value), b.env.get(key).or(a.env.get(key)));
            }
            let keys: BTreeSet<&String> = a.env.keys().chain(b.env.keys()).collect();
            assert_eq!(merged.env.len(), keys.len());
            assert_eq!(merged.privileged, a.privileged || b.privileged);
            assert_eq!(merged.auto_remove, a.auto_remove || b.auto_remove);
        }
    }
}

#[test]
fn empty_configuration_is_identity() {
    for a in sample() {
        let empty = ContainerConfiguration::default();
        assert_eq!(view(&a.merge(&empty)), view(&a));
        assert_eq!(view(&empty.merge(&a)), view(&a));
    }
}

#[test]
fn merge_is_associative() {
    let configs = sample();
    for a in &configs {
        for b in &configs {
            for c in &configs {
                assert_eq!(view(&a.merge(b).merge(c)), view(&a.merge(&b.merge(c))));
            }
        }
    }
}

#[test]
fn network_options_and_labels_union_by_key() {
    let base = NetworkConfiguration {
        options: env(&[("mtu", "1500")]),
        labels: env(&[("team", "a")]),
        ..Default::default()
    };
    let newer = NetworkConfiguration {
        options: env(&[("mtu", "9000"), ("icc", "false")]),
        ..Default::default()
    };
    let merged = base.merge(&newer);
    assert_eq!(merged.options, env(&[("icc", "false"), ("mtu", "9000")]));
    assert_eq!(merged.labels, env(&[("team", "a")]));

    let named = NetworkBuilder::new().with_name("fixed");
    assert_eq!(named.configuration().name.as_deref(), Some("fixed"));
}

// ── Builders compose the same way ───────────────────────────────────────────

#[test]
fn builder_chain_equals_explicit_merge() {
    let chained = ContainerBuilder::from_configuration(ContainerConfiguration::default())
        .with_image("alpine:3")
        .with_command(["sh"])
        .with_env("A", "1")
        .with_privileged(true)
        .with_command(["-c", "sh"])
        .with_env("A", "2")
        .with_privileged(false);

    let config = chained.configuration();
    assert_eq!(config.command, vec!["sh", "-c", "sh"]);
    assert_eq!(config.env["A"], "2");
    assert!(config.privileged, "flags are sticky once set");
}

#[test]
fn startup_callbacks_and_consumers_accumulate_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (first, second) = (seen.clone(), seen.clone());

    let config = ContainerBuilder::new()
        .with_output_consumer(move |_: &OutputChunk| {
            first.lock().unwrap().push("first")
        })
        .with_output_consumer(move |_: &OutputChunk| {
            second.lock().unwrap().push("second")
        })
        .with_wait_strategy(WaitStrategy::tcp(80))
        .configuration()
        .clone();

    let chunk = OutputChunk {
        stream: OutputStream::Stdout,
        bytes: bytes::Bytes::from_static(b"x"),
    };
    for consumer in config.output_consumers.iter() {
        consumer.consume(&chunk);
    }
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn preset_composes_with_generic_configuration() {
    let config = Postgres::default()
        .with_password("hunter2")
        .builder()
        .unwrap()
        .with_env("POSTGRES_PASSWORD", "override")
        .with_env("PGDATA", "/var/lib/postgresql/data/pgdata")
        .with_command(["-c", "fsync=off"])
        .configuration()
        .clone();

    assert_eq!(config.env["POSTGRES_PASSWORD"], "override");
    assert_eq!(config.env["POSTGRES_USER"], "postgres");
    assert_eq!(config.env["PGDATA"], "/var/lib/postgresql/data/pgdata");
    assert_eq!(config.command, vec!["-c", "fsync=off"]);
}

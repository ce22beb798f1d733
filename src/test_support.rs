use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::graph::EntityGraph;
use crate::model::{Entity, EntityHandle, Value};
use crate::registry::{IdentifiableRegistry, RegisteredIdentifiable};
use crate::remote::MemoryRemote;

/// A synthetic crawl together with the remote it is synchronized against.
pub struct GeneratedCrawl {
    pub graph: EntityGraph,
    pub roots: Vec<EntityHandle>,
    pub remote: MemoryRemote,
    pub registry: IdentifiableRegistry,
    /// Crawled entities whose counterpart was seeded into the remote.
    pub preexisting: usize,
}

/// Record types and properties used by generated crawls.
///
/// Reference properties carry the name of the record type they point at,
/// so their datatype resolves to that record type.
pub fn install_schema(remote: &MemoryRemote) {
    remote.add_record_type("Project", None);
    remote.add_record_type("Experiment", None);
    remote.add_record_type("Measurement", None);
    remote.add_property("run", "INTEGER");
    remote.add_property("date", "TEXT");
    remote.add_property("code", "TEXT");
    remote.add_property("value", "DOUBLE");
}

/// Projects are identified by name, experiments by project and run number,
/// measurements by code and the experiment referencing them.
pub fn default_registry() -> IdentifiableRegistry {
    let mut registry = IdentifiableRegistry::new();
    registry.register(RegisteredIdentifiable::new("Project").with_name());
    registry.register(
        RegisteredIdentifiable::new("Experiment")
            .with_property("Project")
            .with_property("run"),
    );
    registry.register(
        RegisteredIdentifiable::new("Measurement")
            .with_property("code")
            .referenced_by(["Experiment"]),
    );
    registry
}

/// Generate `experiments` experiments, each with one measurement, spread
/// over a quarter as many projects. Every project, experiment and
/// measurement exists remotely with probability `existing_probability`
/// (an entity is only seeded when what it depends on was seeded too).
/// Roughly one project in ten is crawled twice.
pub fn generate_crawl(experiments: usize, existing_probability: f64, seed: u64) -> GeneratedCrawl {
    let mut rng = StdRng::seed_from_u64(seed);
    let remote = MemoryRemote::new();
    install_schema(&remote);
    let mut graph = EntityGraph::new();
    let mut roots = Vec::new();
    let mut preexisting = 0;

    let project_count = (experiments / 4).max(1);
    let mut projects: Vec<(Vec<EntityHandle>, Option<i64>)> = Vec::with_capacity(project_count);
    for i in 0..project_count {
        let name = format!("Project_{i:05}");
        let remote_id = if rng.random_bool(existing_probability) {
            preexisting += 1;
            Some(remote.add_entity(Entity::record().with_parent("Project").with_name(&name)))
        } else {
            None
        };
        let mut copies = vec![graph.add(Entity::record().with_parent("Project").with_name(&name))];
        if rng.random_bool(0.1) {
            copies.push(graph.add(Entity::record().with_parent("Project").with_name(&name)));
        }
        roots.extend(copies.iter().copied());
        projects.push((copies, remote_id));
    }

    for run in 0..experiments {
        let (copies, project_id) = &projects[rng.random_range(0..projects.len())];
        let project = copies[rng.random_range(0..copies.len())];
        let code = format!("M{run:06}");
        let value: f64 = rng.random_range(0.0..100.0);
        let date = format!("2024-{:02}-{:02}", 1 + run % 12, 1 + run % 28);

        let measurement = graph.add(
            Entity::record()
                .with_parent("Measurement")
                .with_property("code", code.as_str())
                .with_property("value", value),
        );
        let experiment = graph.add(
            Entity::record()
                .with_parent("Experiment")
                .with_property("Project", project)
                .with_property("run", run as i64)
                .with_property("date", date.as_str())
                .with_property("Measurement", measurement),
        );
        roots.push(experiment);
        roots.push(measurement);

        let Some(project_id) = project_id else {
            continue;
        };
        if !rng.random_bool(existing_probability) {
            continue;
        }
        preexisting += 1;
        let mut remote_experiment = Entity::record()
            .with_parent("Experiment")
            .with_property("Project", Value::Id(*project_id))
            .with_property("run", run as i64);
        // a changed date turns the experiment into an update
        if rng.random_bool(0.5) {
            remote_experiment = remote_experiment.with_property("date", date.as_str());
        } else {
            remote_experiment = remote_experiment.with_property("date", "unknown");
        }
        if rng.random_bool(existing_probability) {
            preexisting += 1;
            let measurement_id = remote.add_entity(
                Entity::record()
                    .with_parent("Measurement")
                    .with_property("code", code.as_str())
                    .with_property("value", value),
            );
            remote_experiment = remote_experiment
                .with_property("Measurement", Value::Id(measurement_id));
        }
        remote.add_entity(remote_experiment);
    }

    GeneratedCrawl {
        graph,
        roots,
        remote,
        registry: default_registry(),
        preexisting,
    }
}

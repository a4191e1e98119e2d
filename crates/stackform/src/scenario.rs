//! Deployment scenarios: which stacks to compose, in which order.
use snafu::prelude::*;

use crate::{
    stacks::{
        application::{self, Placement},
        artifact, network, pipeline, storage,
    },
    Config, OutputMap, Provisioner, StackDescriptor, Stage, NAMESPACE,
};

#[derive(Debug, Snafu)]
#[snafu(display(
    "Unknown scenario '{name}', expected one of: {}",
    Scenario::ALL.map(|s| s.to_string()).join(", ")
))]
pub struct UnknownScenario {
    name: String,
}

/// A named, ordered set of stacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// The artifact bucket alone.
    Artifacts,
    /// Artifact bucket, a backend in its own VPC and its delivery pipeline.
    BackendCicd,
    /// Network, database, artifact bucket and a backend next to the database.
    VpcBackend,
    /// Everything in [`Scenario::VpcBackend`] plus the delivery pipeline.
    Full,
}

impl core::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Scenario::Artifacts => "artifacts",
            Scenario::BackendCicd => "backend-cicd",
            Scenario::VpcBackend => "vpc-backend",
            Scenario::Full => "full",
        })
    }
}

impl core::str::FromStr for Scenario {
    type Err = UnknownScenario;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.to_string() == s)
            .context(UnknownScenarioSnafu { name: s })
    }
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::Artifacts,
        Scenario::BackendCicd,
        Scenario::VpcBackend,
        Scenario::Full,
    ];

    /// The stages of this scenario, in composition order.
    pub fn stages<P: Provisioner>(&self, config: &Config) -> Vec<Stage<P>> {
        match self {
            Scenario::Artifacts => vec![artifact::stage(config)],
            Scenario::BackendCicd => vec![
                artifact::stage(config),
                application::stage(config, Placement::Standalone),
                pipeline::stage(config),
            ],
            Scenario::VpcBackend => vec![
                network::stage(config),
                storage::stage(config),
                artifact::stage(config),
                application::stage(config, Placement::InVpc),
            ],
            Scenario::Full => vec![
                network::stage(config),
                storage::stage(config),
                artifact::stage(config),
                application::stage(config, Placement::InVpc),
                pipeline::stage(config),
            ],
        }
    }

    /// The descriptors of [`Scenario::stages`], without needing a
    /// configuration.
    pub fn descriptors(&self, namespace: &str) -> Vec<StackDescriptor> {
        match self {
            Scenario::Artifacts => vec![artifact::descriptor(namespace)],
            Scenario::BackendCicd => vec![
                artifact::descriptor(namespace),
                application::descriptor(namespace, Placement::Standalone),
                pipeline::descriptor(namespace),
            ],
            Scenario::VpcBackend => vec![
                network::descriptor(namespace),
                storage::descriptor(namespace),
                artifact::descriptor(namespace),
                application::descriptor(namespace, Placement::InVpc),
            ],
            Scenario::Full => vec![
                network::descriptor(namespace),
                storage::descriptor(namespace),
                artifact::descriptor(namespace),
                application::descriptor(namespace, Placement::InVpc),
                pipeline::descriptor(namespace),
            ],
        }
    }
}

/// The output map composition starts from: just the namespace.
pub fn initial(namespace: &str) -> OutputMap {
    OutputMap::single(NAMESPACE, namespace)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn names_round_trip() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario, scenario.to_string().parse::<Scenario>().unwrap());
        }
        let err = "s3-only".parse::<Scenario>().unwrap_err();
        assert_eq!(
            "Unknown scenario 's3-only', expected one of: artifacts, backend-cicd, vpc-backend, full",
            err.to_string()
        );
    }

    #[test]
    fn descriptors_match_stages() {
        let config = crate::config::test::dev_config();
        for scenario in Scenario::ALL {
            let stages = scenario.stages::<crate::synth::Synth>(&config);
            let from_stages = stages
                .iter()
                .map(|stage| stage.descriptor().clone())
                .collect::<Vec<_>>();
            assert_eq!(scenario.descriptors("demo-dev"), from_stages, "{scenario}");
        }
    }

    #[test]
    fn initial_holds_the_namespace() {
        let outputs = initial("demo-dev");
        assert_eq!(vec![NAMESPACE], outputs.keys().collect::<Vec<_>>());
        assert_eq!("demo-dev", outputs.value(NAMESPACE).unwrap());
    }
}

use std::{cell::Cell, rc::Rc};

use pretty_assertions::assert_eq;
use snafu::prelude::*;

use crate::{
    config::test::dev_config,
    scenario::initial,
    stacks::{
        application::{self, Placement},
        artifact, network, pipeline, storage,
    },
    synth::{self, Synth},
    *,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn synth() -> Synth {
    Synth::new(dev_config().environment())
}

/// A stage that declares one bucket per produced key and counts its runs.
fn counted_stage(
    name: &str,
    requires: &[&str],
    produces: &[&str],
    runs: &Rc<Cell<usize>>,
) -> Stage<Synth> {
    let descriptor = requires
        .iter()
        .fold(StackDescriptor::new(name), |d, key| d.requires(*key));
    let descriptor = produces.iter().fold(descriptor, |d, key| d.produces(*key));
    let produces = descriptor.produces.clone();
    let runs = runs.clone();
    Stage::new(descriptor, move |scope, _upstream| {
        runs.set(runs.get() + 1);
        let mut outputs = OutputMap::new();
        for (i, key) in produces.iter().enumerate() {
            let bucket = scope.declare(Declaration::new(format!("Bucket{i}"), "AWS::S3::Bucket"))?;
            outputs.insert(key.as_str(), bucket)?;
        }
        Ok(outputs)
    })
}

#[test]
fn valid_order_yields_union_of_outputs() {
    init_logging();
    let runs = Rc::new(Cell::new(0));
    let stages = vec![
        counted_stage("a", &[], &["x"], &runs),
        counted_stage("b", &["x"], &["y", "z"], &runs),
        counted_stage("c", &["x", "z"], &["w"], &runs),
    ];
    let outputs = compose(&stages, OutputMap::new(), &mut synth()).unwrap();
    assert_eq!(3, runs.get());
    assert_eq!(
        vec!["w", "x", "y", "z"],
        outputs.keys().collect::<Vec<_>>()
    );
    assert_eq!("b", outputs.resource("y").unwrap().stack);
}

#[test]
fn missing_dependency_is_never_built() {
    init_logging();
    let runs = Rc::new(Cell::new(0));
    let stages = vec![
        counted_stage("a", &[], &["x"], &runs),
        counted_stage("b", &["x", "y"], &["z"], &runs),
        counted_stage("c", &[], &["y"], &runs),
    ];
    let mut synth = synth();
    let err = compose(&stages, OutputMap::new(), &mut synth).unwrap_err();
    assert!(
        matches!(&err, Error::MissingDependency { stage, key } if stage == "b" && key == "y"),
        "{err}"
    );
    assert_eq!("MissingDependencyError", err.kind());
    assert_eq!(Some("b"), err.stage());
    assert_eq!(1, runs.get());
    // the stack of the failing stage was never opened
    assert!(synth.assembly().stack("b").is_none());
}

#[test]
fn duplicate_output_stops_composition() {
    init_logging();
    let runs = Rc::new(Cell::new(0));
    let stages = vec![
        counted_stage("a", &[], &["x"], &runs),
        counted_stage("b", &[], &["y", "x"], &runs),
        counted_stage("c", &["x"], &["z"], &runs),
    ];
    let err = compose(&stages, OutputMap::new(), &mut synth()).unwrap_err();
    assert!(
        matches!(&err, Error::DuplicateOutput { stage, key } if stage == "b" && key == "x"),
        "{err}"
    );
    assert_eq!("DuplicateOutputError", err.kind());
    assert_eq!(1, runs.get());
}

#[test]
fn initial_outputs_cannot_be_redefined() {
    let runs = Rc::new(Cell::new(0));
    let stages = vec![counted_stage("a", &[], &[NAMESPACE], &runs)];
    let err = compose(&stages, initial("demo-dev"), &mut synth()).unwrap_err();
    assert!(matches!(err, Error::DuplicateOutput { .. }), "{err}");
    assert_eq!(0, runs.get());
}

#[test]
fn builders_see_only_what_they_require() {
    let runs = Rc::new(Cell::new(0));
    let observe = Stage::new(
        StackDescriptor::new("observer").requires("x").produces("seen"),
        |_scope, upstream: &OutputMap| {
            anyhow::ensure!(
                upstream.keys().collect::<Vec<_>>() == ["x"],
                "unexpected upstream [{upstream}]"
            );
            Ok(OutputMap::single("seen", "yes"))
        },
    );
    let stages = vec![
        counted_stage("a", &[], &["x", "y"], &runs),
        observe,
    ];
    let outputs = compose(&stages, initial("demo-dev"), &mut synth()).unwrap();
    assert_eq!("yes", outputs.value("seen").unwrap());
}

#[test]
fn stages_must_keep_their_promises() {
    let unfulfilled = Stage::new(
        StackDescriptor::new("lazy").produces("x"),
        |_scope, _upstream: &OutputMap| Ok(OutputMap::new()),
    );
    let err = compose(&[unfulfilled], OutputMap::new(), &mut synth()).unwrap_err();
    assert!(
        matches!(&err, Error::UnfulfilledOutput { stage, key } if stage == "lazy" && key == "x"),
        "{err}"
    );
    assert_eq!("CompositionError", err.kind());

    let undeclared = Stage::new(
        StackDescriptor::new("eager").produces("x"),
        |_scope, _upstream: &OutputMap| {
            Ok(OutputMap::single("x", "1").with("y", "2")?)
        },
    );
    let err = compose(&[undeclared], OutputMap::new(), &mut synth()).unwrap_err();
    assert!(
        matches!(&err, Error::UndeclaredOutput { stage, key } if stage == "eager" && key == "y"),
        "{err}"
    );
}

#[test]
fn check_matches_compose() {
    let namespace = dev_config().namespace();
    let defined = check(&Scenario::Full.descriptors(&namespace), &initial(&namespace)).unwrap();
    assert_eq!(
        vec![
            stacks::ARTIFACT_BUCKET,
            stacks::DB_INSTANCE,
            stacks::ECR_REPOSITORY,
            stacks::FARGATE_SERVICE,
            NAMESPACE,
            stacks::VPC,
        ],
        defined.iter().map(String::as_str).collect::<Vec<_>>()
    );

    let mut descriptors = Scenario::VpcBackend.descriptors(&namespace);
    descriptors.swap(0, 1);
    let err = check(&descriptors, &initial(&namespace)).unwrap_err();
    assert!(
        matches!(&err, Error::MissingDependency { stage, key }
            if stage == "demo-dev-StorageStack" && key == stacks::VPC),
        "{err}"
    );

    let descriptors = [artifact::descriptor(&namespace), artifact::descriptor(&namespace)];
    let err = check(&descriptors, &OutputMap::new()).unwrap_err();
    assert!(matches!(err, Error::DuplicateOutput { .. }), "{err}");

    // a stage listing the same output twice is rejected by both
    let runs = Rc::new(Cell::new(0));
    let stages = vec![counted_stage("a", &[], &["x", "x"], &runs)];
    let err = check([stages[0].descriptor()], &OutputMap::new()).unwrap_err();
    assert!(
        matches!(&err, Error::DuplicateOutput { stage, key } if stage == "a" && key == "x"),
        "{err}"
    );
    let err = compose(&stages, OutputMap::new(), &mut synth()).unwrap_err();
    assert!(
        matches!(&err, Error::DuplicateOutput { stage, key } if stage == "a" && key == "x"),
        "{err}"
    );
    assert_eq!(0, runs.get());
}

#[test]
fn backend_in_vpc_composes() {
    init_logging();
    let config = dev_config();
    assert_eq!("demo-dev", config.namespace());
    let stages = vec![
        network::stage(&config),
        storage::stage(&config),
        artifact::stage(&config),
        application::stage(&config, Placement::InVpc),
    ];

    let mut synth = Synth::new(config.environment());
    let outputs = compose(&stages, OutputMap::new(), &mut synth).unwrap();
    assert_eq!(
        vec!["artifact_bucket", "db_instance", "fargate_service", "vpc"],
        outputs.keys().collect::<Vec<_>>()
    );

    // the namespace passes through untouched
    let mut synth = Synth::new(config.environment());
    let outputs = compose(&stages, initial(&config.namespace()), &mut synth).unwrap();
    assert_eq!(
        vec![
            "artifact_bucket",
            "db_instance",
            "fargate_service",
            "namespace",
            "vpc"
        ],
        outputs.keys().collect::<Vec<_>>()
    );
    assert_eq!("demo-dev", outputs.value(NAMESPACE).unwrap());
    assert_eq!(
        "demo-dev-ApplicationStack",
        outputs.resource(stacks::FARGATE_SERVICE).unwrap().stack
    );
}

#[test]
fn artifacts_alone_need_no_network() {
    let config = dev_config();
    let stages = vec![artifact::stage::<Synth>(&config)];
    assert!(stages[0].descriptor().requires.is_empty());

    let mut synth = Synth::new(config.environment());
    let outputs = compose(&stages, OutputMap::new(), &mut synth).unwrap();
    assert_eq!(
        vec![stacks::ARTIFACT_BUCKET],
        outputs.keys().collect::<Vec<_>>()
    );

    let assembly = synth.finish();
    assert_eq!(1, assembly.stacks().len());
    let template = &assembly.stack("demo-dev-ArtifactStack").unwrap().template;
    assert_eq!(
        serde_json::json!("demo-dev-artifacts"),
        template.resources["ArtifactBucket"].properties["BucketName"]
    );
}

#[test]
fn every_scenario_synthesizes() {
    init_logging();
    let config = dev_config();
    for scenario in Scenario::ALL {
        let mut synth = Synth::new(config.environment());
        let outputs = compose(
            &scenario.stages(&config),
            initial(&config.namespace()),
            &mut synth,
        )
        .unwrap();
        let expected = check(
            &scenario.descriptors(&config.namespace()),
            &initial(&config.namespace()),
        )
        .unwrap();
        assert_eq!(
            expected.iter().map(String::as_str).collect::<Vec<_>>(),
            outputs.keys().collect::<Vec<_>>(),
            "{scenario}"
        );
        assert_eq!(
            scenario.descriptors(&config.namespace()).len(),
            synth.assembly().stacks().len(),
            "{scenario}"
        );
    }
}

#[test]
fn cross_stack_references_become_dependencies() {
    let config = dev_config();
    let mut synth = Synth::new(config.environment());
    compose(
        &Scenario::Full.stages(&config),
        initial(&config.namespace()),
        &mut synth,
    )
    .unwrap();
    let assembly = synth.finish();

    let dependencies = |name: &str| {
        assembly
            .stack(&format!("demo-dev-{name}"))
            .unwrap()
            .dependencies
            .iter()
            .cloned()
            .collect::<Vec<_>>()
    };
    assert!(dependencies("NetworkStack").is_empty());
    assert!(dependencies("ArtifactStack").is_empty());
    assert_eq!(vec!["demo-dev-NetworkStack"], dependencies("StorageStack"));
    assert_eq!(
        vec!["demo-dev-NetworkStack", "demo-dev-StorageStack"],
        dependencies("ApplicationStack")
    );
    assert_eq!(
        vec!["demo-dev-ApplicationStack", "demo-dev-ArtifactStack"],
        dependencies("PipelineStack")
    );

    let pipeline_template = &assembly.stack("demo-dev-PipelineStack").unwrap().template;
    let stage_names = pipeline_template.resources["Pipeline"].properties["Stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|stage| stage["Name"].as_str().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(pipeline::STAGES.to_vec(), stage_names);
    assert_eq!(
        serde_json::json!({ "Fn::ImportValue": "demo-dev-ArtifactStack:ArtifactBucket:Ref" }),
        pipeline_template.resources["Pipeline"].properties["ArtifactStore"]["Location"]
    );
}

#[test]
fn standalone_backend_brings_its_own_network() {
    let config = dev_config();
    let mut synth = Synth::new(config.environment());
    compose(
        &Scenario::BackendCicd.stages(&config),
        initial(&config.namespace()),
        &mut synth,
    )
    .unwrap();
    let assembly = synth.finish();
    let application = assembly.stack("demo-dev-ApplicationStack").unwrap();
    assert!(application.dependencies.is_empty());
    assert_eq!(
        vec!["Vpc"],
        application
            .template
            .resources_of_type("AWS::EC2::VPC")
            .collect::<Vec<_>>()
    );
    assert!(assembly.stack("demo-dev-NetworkStack").is_none());
}

#[test]
fn bootstrap_image_is_synthesized() {
    let config = dev_config().with_image(ImageChoice::Bootstrap);
    let mut synth = Synth::new(config.environment());
    compose(
        &Scenario::BackendCicd.stages(&config),
        initial(&config.namespace()),
        &mut synth,
    )
    .unwrap();
    let assembly = synth.finish();
    let template = &assembly.stack("demo-dev-ApplicationStack").unwrap().template;
    assert_eq!(
        serde_json::json!(application::BOOTSTRAP_IMAGE),
        template.resources["TaskDefinition"].properties["ContainerDefinitions"][0]["Image"]
    );
    assert_eq!(
        serde_json::json!("/"),
        template.resources["TargetGroup"].properties["HealthCheckPath"]
    );
}

#[derive(Debug, Snafu)]
enum RefusalError {
    #[snafu(display("refusing to declare '{logical_id}'"))]
    Refused { logical_id: String },

    #[snafu(transparent)]
    Synth { source: synth::Error },
}

/// Synthesizes everything except resources of one type.
struct Refusing {
    inner: Synth,
    resource_type: &'static str,
}

impl Provisioner for Refusing {
    type Error = RefusalError;

    fn begin_stack(&mut self, stack: &str) -> Result<(), Self::Error> {
        Ok(self.inner.begin_stack(stack)?)
    }

    fn declare(
        &mut self,
        stack: &str,
        declaration: Declaration,
    ) -> Result<ResourceRef, Self::Error> {
        ensure!(
            declaration.resource_type != self.resource_type,
            RefusedSnafu {
                logical_id: declaration.logical_id
            }
        );
        Ok(self.inner.declare(stack, declaration)?)
    }

    fn reference(
        &mut self,
        stack: &str,
        target: &ResourceRef,
        attribute: Option<&str>,
    ) -> Result<serde_json::Value, Self::Error> {
        Ok(self.inner.reference(stack, target, attribute)?)
    }

    fn output(
        &mut self,
        stack: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), Self::Error> {
        Ok(self.inner.output(stack, name, value)?)
    }
}

#[test]
fn build_errors_name_the_stage() {
    init_logging();
    let config = dev_config();
    let mut refusing = Refusing {
        inner: Synth::new(config.environment()),
        resource_type: "AWS::RDS::DBInstance",
    };
    let err = compose(
        &Scenario::VpcBackend.stages(&config),
        initial(&config.namespace()),
        &mut refusing,
    )
    .unwrap_err();
    assert_eq!("BuildError", err.kind());
    assert_eq!(Some("demo-dev-StorageStack"), err.stage());
    assert_eq!(
        "Error building 'demo-dev-StorageStack': refusing to declare 'DbInstance'",
        err.to_string()
    );
    // nothing after the failing stage was started
    assert_eq!(2, refusing.inner.assembly().stacks().len());
}

#[test]
fn unknown_environment_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let err: Error = Config::load("staging", dir.path()).unwrap_err().into();
    assert_eq!("ConfigurationError", err.kind());
    assert_eq!(None, err.stage());
    assert!(err.to_string().contains("staging"), "{err}");
}

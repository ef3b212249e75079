use serde_json::{json, Value};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use yesses_core::{
    Config, ConfigError, Error, FindingsMap, FindingsRegistry, InputSpec, Module, ModuleError,
    ModuleRegistry, ModuleResults, ModuleSpec, OutputSpec, Record, RegistryError, RunOptions,
    RunOutcome, Runner, Severity, StateError, StatePaths, StepContext, StepError,
};
use yesses_core::state::{AlertsResumeState, ResumeState, StateFile};

type Executed = Rc<RefCell<Vec<usize>>>;

struct Emit {
    items: Vec<Value>,
    fail: bool,
    executed: Executed,
}

impl Module for Emit {
    fn run(&mut self, ctx: &mut StepContext) -> Result<ModuleResults, ModuleError> {
        if self.fail {
            return Err(ModuleError::Failed("scanner crashed".to_string()));
        }
        self.executed.borrow_mut().push(ctx.step().number);
        ctx.log(format!("emitting {} record(s)", self.items.len()));
        let records: Vec<Record> = self
            .items
            .iter()
            .filter_map(|item| item.as_object())
            .map(|map| map.clone().into_iter().collect())
            .collect();
        let mut results = ModuleResults::new();
        results.insert("Items".to_string(), records);
        Ok(results)
    }
}

fn modules(executed: &Executed) -> ModuleRegistry {
    let executed = executed.clone();
    let mut modules = ModuleRegistry::new();
    modules
        .register(
            ModuleSpec::new("emit", "Records", "returns the given records")
                .input(InputSpec::scalar("items", "records to emit"))
                .input(InputSpec::records("extra", &["n"], "more records").with_default(json!([])))
                .input(InputSpec::scalar("fail", "raise instead of emitting").with_default(json!(false)))
                .output(OutputSpec::records("Items", &["n"], "the emitted records")),
            move |_, inputs| {
                let mut items = match inputs.get("items") {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                if let Some(Value::Array(extra)) = inputs.get("extra") {
                    items.extend(extra.iter().cloned());
                }
                Ok(Box::new(Emit {
                    items,
                    fail: inputs.get("fail") == Some(&json!(true)),
                    executed: executed.clone(),
                }) as Box<dyn Module>)
            },
        )
        .unwrap();
    modules
}

fn key(step: usize) -> String {
    format!("Step-{}", (b'A' + step as u8) as char)
}

/// Five (or `steps`) chained steps; step 0 always raises a MEDIUM alert.
fn pipeline(steps: usize, failing: Option<usize>) -> String {
    let mut yaml = String::from("data:\n  Seeds:\n    - n: 100\n\nrun:\n");
    for step in 0..steps {
        yaml.push_str(&format!(
            "  - emit Records:\n      items:\n        - n: {step}\n      extra: use Seeds\n      fail: {}\n    name: step {step}\n    find:\n      - Items as {}\n",
            failing == Some(step),
            key(step)
        ));
        if step == 0 {
            yaml.push_str("    expect:\n      - no Step-A, otherwise alert medium\n");
        }
    }
    yaml
}

fn write_config(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("scan.yml");
    fs::write(&path, text).unwrap();
    path
}

fn run(path: &Path, modules: &ModuleRegistry, options: RunOptions) -> Result<RunOutcome, Error> {
    let config = Config::load(path, modules)?;
    Runner::new(config, modules, options)?.run()
}

#[test]
fn full_run_executes_every_step_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(5, None));

    let outcome = run(&path, &modules, RunOptions::default()).unwrap();
    assert_eq!(*executed.borrow(), vec![0, 1, 2, 3, 4]);
    assert_eq!(outcome.report.alerts.len(), 1);
    assert_eq!(outcome.report.summary.max_severity, Some(Severity::Medium));
    assert!(outcome.has_alert_at_least(Severity::Medium));
    assert!(!outcome.has_alert_at_least(Severity::High));
    assert!(outcome.report.steps.iter().all(|step| step.executed));
    assert_eq!(outcome.report.steps[0].name, "step 0");

    let paths = StatePaths::for_config(&path);
    let baseline = FindingsRegistry::new(&paths.persist, &paths.resume, FindingsMap::new(), false)
        .unwrap();
    for step in 0..5 {
        assert_eq!(
            baseline.get_previous(&key(step), &[]).len(),
            2,
            "baseline for {}",
            key(step)
        );
    }
}

#[test]
fn resume_snapshots_match_state_after_each_step() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(5, None));
    run(&path, &modules, RunOptions::default()).unwrap();

    let paths = StatePaths::for_config(&path);
    for step in 0..5 {
        let mut registry =
            FindingsRegistry::new(&paths.persist, &paths.resume, FindingsMap::new(), false)
                .unwrap();
        assert_eq!(registry.load_resume(Some(step)).unwrap(), step);
        let keys: Vec<&String> = registry.current().keys().collect();
        // Seeds plus one key per completed step
        assert_eq!(keys.len(), step + 2);
        assert!(registry.contains(&key(step)));
        assert!(!registry.contains(&key(step + 1)));
    }
}

#[test]
fn repeat_reexecutes_trailing_window() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(5, None));
    run(&path, &modules, RunOptions::default()).unwrap();
    executed.borrow_mut().clear();

    let outcome = run(
        &path,
        &modules,
        RunOptions {
            repeat: Some(2),
            ..RunOptions::default()
        },
    )
    .unwrap();
    assert_eq!(*executed.borrow(), vec![3, 4]);
    let ran: Vec<bool> = outcome.report.steps.iter().map(|s| s.executed).collect();
    assert_eq!(ran, vec![false, false, false, true, true]);
    // the alert of step 0 comes back from the snapshot
    assert_eq!(outcome.report.alerts.len(), 1);
    assert_eq!(outcome.report.alerts[0].step.number, 0);
}

#[test]
fn repeating_more_steps_than_exist_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(5, None));
    run(&path, &modules, RunOptions::default()).unwrap();
    executed.borrow_mut().clear();

    let err = run(
        &path,
        &modules,
        RunOptions {
            repeat: Some(10),
            ..RunOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::State(StateError::NotEnoughSteps {
            total: 5,
            repeat: 10,
            ..
        })
    ));
    assert!(executed.borrow().is_empty());
}

#[test]
fn fresh_repeat_does_not_restore_an_earlier_run() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(5, None));
    run(&path, &modules, RunOptions::default()).unwrap();
    executed.borrow_mut().clear();

    let err = run(
        &path,
        &modules,
        RunOptions {
            fresh: true,
            repeat: Some(2),
            ..RunOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::State(StateError::MissingSnapshot { step: 2 })
    ));
    assert!(executed.borrow().is_empty());
}

#[test]
fn repeat_keeps_replay_and_resume_leaves_it() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(5, None));
    run(&path, &modules, RunOptions::default()).unwrap();

    let config = Config::load(&path, &modules).unwrap();
    let mut repeating = Runner::new(
        config,
        &modules,
        RunOptions {
            repeat: Some(2),
            ..RunOptions::default()
        },
    )
    .unwrap();
    assert_eq!(repeating.prepare().unwrap(), Some(2));
    assert!(repeating.findings().is_replay());

    let config = Config::load(&path, &modules).unwrap();
    let mut resuming = Runner::new(
        config,
        &modules,
        RunOptions {
            resume: true,
            ..RunOptions::default()
        },
    )
    .unwrap();
    assert_eq!(resuming.prepare().unwrap(), Some(4));
    assert!(!resuming.findings().is_replay());
}

#[test]
fn resumed_steps_may_not_overwrite_restored_findings() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(5, Some(3)));
    run(&path, &modules, RunOptions::default()).unwrap_err();
    executed.borrow_mut().clear();

    // the snapshot after step 2 already holds the key step 3 will store
    let paths = StatePaths::for_config(&path);
    let mut resume: StateFile<ResumeState> = StateFile::open(&paths.resume, false).unwrap();
    let snapshot = resume.data_mut().snapshots.get_mut(&2).unwrap();
    snapshot.insert(key(3), vec![]);
    resume.save().unwrap();

    write_config(dir.path(), &pipeline(5, None));
    let err = run(
        &path,
        &modules,
        RunOptions {
            resume: true,
            ..RunOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::Step(StepError::Registry {
            ref step,
            source: RegistryError::DuplicateKey { .. },
        }) if step.number == 3
    ));
    assert_eq!(*executed.borrow(), vec![3]);
}

#[test]
fn resume_continues_after_interruption() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(5, Some(3)));

    let err = run(&path, &modules, RunOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Step(StepError::Module { ref step, .. }) if step.number == 3));
    assert_eq!(*executed.borrow(), vec![0, 1, 2]);
    executed.borrow_mut().clear();

    write_config(dir.path(), &pipeline(5, None));
    let outcome = run(
        &path,
        &modules,
        RunOptions {
            resume: true,
            ..RunOptions::default()
        },
    )
    .unwrap();
    assert_eq!(*executed.borrow(), vec![3, 4]);
    assert_eq!(outcome.report.alerts.len(), 1);
    assert!(!outcome.report.steps[2].executed);
}

#[test]
fn resume_without_resume_data_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(2, None));
    let err = run(
        &path,
        &modules,
        RunOptions {
            resume: true,
            ..RunOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::State(StateError::NoResumeData { .. })));
}

#[test]
fn mismatched_resume_stores_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(dir.path(), &pipeline(5, None));
    run(&path, &modules, RunOptions::default()).unwrap();

    let paths = StatePaths::for_config(&path);
    let mut alerts: StateFile<AlertsResumeState> = StateFile::open(&paths.alerts, false).unwrap();
    alerts.data_mut().last_step = Some(1);
    alerts.save().unwrap();

    let err = run(
        &path,
        &modules,
        RunOptions {
            resume: true,
            ..RunOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::State(StateError::Inconsistent {
            findings_step: 4,
            alerts_step: 1
        })
    ));
}

#[test]
fn new_items_are_measured_against_the_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let config = |items: &str| {
        format!(
            "run:\n  - emit Records:\n      items: {items}\n    find:\n      - Items as Open-Ports\n    expect:\n      - no new Open-Ports, otherwise alert high\n"
        )
    };

    let path = write_config(dir.path(), &config("[{n: 22}]"));
    let first = run(&path, &modules, RunOptions::default()).unwrap();
    assert_eq!(first.report.alerts.len(), 1, "everything is new on the first run");

    write_config(dir.path(), &config("[{n: 22}, {n: 8080}]"));
    let second = run(&path, &modules, RunOptions::default()).unwrap();
    assert_eq!(second.report.alerts.len(), 1);
    let alert = &second.report.alerts[0];
    assert_eq!(alert.severity, Severity::High);
    let mut expected = Record::new();
    expected.insert("n".to_string(), json!(8080));
    assert_eq!(alert.findings["extra items"], vec![expected]);

    let third = run(&path, &modules, RunOptions::default()).unwrap();
    assert!(third.report.alerts.is_empty());

    let fresh = run(
        &path,
        &modules,
        RunOptions {
            fresh: true,
            ..RunOptions::default()
        },
    )
    .unwrap();
    assert_eq!(fresh.report.alerts[0].finding_count(), 2);
}

#[test]
fn unknown_find_output_fails_before_execution() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let path = write_config(
        dir.path(),
        "run:\n  - emit Records:\n      items: []\n    find:\n      - Items\n  - emit Records:\n      items: []\n    find:\n      - Domains\n",
    );
    let err = Config::load(&path, &modules).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownOutput { ref output, .. } if output == "Domains"));
    assert!(err.to_string().starts_with("Step #1 (emit Records)"));
    assert!(executed.borrow().is_empty());
}

#[test]
fn reports_are_written_next_to_the_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Executed::default();
    let modules = modules(&executed);
    let mut text = pipeline(1, None);
    text.push_str("\noutput:\n  - markdown:\n      filename: reports/scan.md\n  - json:\n      filename: scan.json\n");
    let path = write_config(dir.path(), &text);

    let outcome = run(&path, &modules, RunOptions::default()).unwrap();
    assert_eq!(outcome.written.len(), 2);
    let markdown = fs::read_to_string(dir.path().join("reports/scan.md")).unwrap();
    assert!(markdown.contains("no Step-A, otherwise alert medium"));
    let json: Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("scan.json")).unwrap()).unwrap();
    assert_eq!(json["summary"]["max_severity"], json!("MEDIUM"));
}

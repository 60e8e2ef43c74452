// SPDX-License-Identifier: CEPL-1.0
//! Engine modules with declared dependencies and capabilities.
//!
//! Modules are registered up front, ordered so every dependency starts
//! before its dependents, and shut down in the reverse order.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PluginRecord {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_version() -> String {
    "0.1.0".to_owned()
}

impl PluginRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            capabilities: BTreeSet::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn provides(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.insert(cap.into());
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin {0} is already registered")]
    Duplicate(String),

    #[error("plugin {plugin} depends on {dependency}, which is not registered")]
    MissingDependency { plugin: String, dependency: String },

    #[error("dependency cycle among {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("plugin {plugin} failed to {stage}: {reason}")]
    Lifecycle {
        plugin: String,
        stage: &'static str,
        reason: String,
    },
}

pub trait Module {
    fn record(&self) -> &PluginRecord;

    fn load(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn unload(&mut self) {}
}

/// A module that exists only as its record, e.g. one declared in config.
#[derive(Debug, Clone)]
pub struct DeclaredPlugin {
    record: PluginRecord,
}

impl DeclaredPlugin {
    pub fn new(record: PluginRecord) -> Self {
        Self { record }
    }
}

impl Module for DeclaredPlugin {
    fn record(&self) -> &PluginRecord {
        &self.record
    }

    fn start(&mut self) -> Result<(), PluginError> {
        debug!("plugin {} {} started", self.record.name, self.record.version);
        Ok(())
    }

    fn stop(&mut self) {
        debug!("plugin {} stopped", self.record.name);
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    modules: BTreeMap<String, Box<dyn Module>>,
    /// Names of started modules, in start order.
    started: Vec<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn register(&mut self, module: Box<dyn Module>) -> Result<(), PluginError> {
        let name = module.record().name.clone();
        if self.modules.contains_key(&name) {
            return Err(PluginError::Duplicate(name));
        }
        self.modules.insert(name, module);
        Ok(())
    }

    /// Dependencies first; among modules whose dependencies are all placed,
    /// the lexically smallest name goes next.
    pub fn resolve_order(&self) -> Result<Vec<String>, PluginError> {
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, module) in &self.modules {
            let deps: BTreeSet<&str> = module.record().depends_on.iter().map(String::as_str).collect();
            for dep in &deps {
                if !self.modules.contains_key(*dep) {
                    return Err(PluginError::MissingDependency {
                        plugin: name.clone(),
                        dependency: (*dep).to_owned(),
                    });
                }
                dependents.entry(*dep).or_default().push(name.as_str());
            }
            indegree.insert(name.as_str(), deps.len());
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(self.modules.len());
        while let Some(next) = ready.pop_first() {
            order.push(next.to_owned());
            for dependent in dependents.get(next).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() < self.modules.len() {
            let stuck = indegree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| n.to_owned())
                .collect();
            return Err(PluginError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Loads and starts every module in dependency order. On failure the
    /// modules already started are shut down again.
    pub fn start_all(&mut self) -> Result<(), PluginError> {
        let order = self.resolve_order()?;
        for name in order {
            let Some(module) = self.modules.get_mut(&name) else {
                continue;
            };
            let started = module.load().and_then(|()| module.start());
            if let Err(e) = started {
                module.unload();
                self.shutdown_all();
                return Err(e);
            }
            self.started.push(name);
        }
        info!("{} plugins started: {}", self.started.len(), self.started.join(", "));
        Ok(())
    }

    /// Stops and unloads started modules, last started first.
    pub fn shutdown_all(&mut self) {
        while let Some(name) = self.started.pop() {
            if let Some(module) = self.modules.get_mut(&name) {
                module.stop();
                module.unload();
                debug!("plugin {name} shut down");
            }
        }
    }

    pub fn started(&self) -> &[String] {
        &self.started
    }

    /// Names of modules providing `cap`, in name order.
    pub fn find_capability(&self, cap: &str) -> Vec<&str> {
        self.modules
            .values()
            .map(|m| m.record())
            .filter(|r| r.capabilities.contains(cap))
            .map(|r| r.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    type Journal = Rc<RefCell<Vec<String>>>;

    struct Recorder {
        record: PluginRecord,
        journal: Journal,
        fail_start: bool,
    }

    impl Recorder {
        fn boxed(record: PluginRecord, journal: &Journal) -> Box<dyn Module> {
            Box::new(Self {
                record,
                journal: journal.clone(),
                fail_start: false,
            })
        }

        fn log(&self, what: &str) {
            self.journal.borrow_mut().push(format!("{what} {}", self.record.name));
        }
    }

    impl Module for Recorder {
        fn record(&self) -> &PluginRecord {
            &self.record
        }

        fn load(&mut self) -> Result<(), PluginError> {
            self.log("load");
            Ok(())
        }

        fn start(&mut self) -> Result<(), PluginError> {
            if self.fail_start {
                return Err(PluginError::Lifecycle {
                    plugin: self.record.name.clone(),
                    stage: "start",
                    reason: "refused".into(),
                });
            }
            self.log("start");
            Ok(())
        }

        fn stop(&mut self) {
            self.log("stop");
        }

        fn unload(&mut self) {
            self.log("unload");
        }
    }

    fn registry(records: Vec<PluginRecord>) -> PluginRegistry {
        let mut r = PluginRegistry::new();
        for rec in records {
            r.register(Box::new(DeclaredPlugin::new(rec))).unwrap();
        }
        r
    }

    #[test]
    fn dependencies_come_first_and_ties_break_by_name() {
        let r = registry(vec![
            PluginRecord::new("render").depends_on("window").depends_on("core"),
            PluginRecord::new("window").depends_on("core"),
            PluginRecord::new("core"),
            PluginRecord::new("audio").depends_on("core"),
        ]);
        assert_eq!(r.resolve_order().unwrap(), ["core", "audio", "window", "render"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut r = registry(vec![PluginRecord::new("core")]);
        let err = r
            .register(Box::new(DeclaredPlugin::new(PluginRecord::new("core"))))
            .unwrap_err();
        assert_eq!(err, PluginError::Duplicate("core".into()));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let r = registry(vec![PluginRecord::new("render").depends_on("gpu")]);
        assert_eq!(
            r.resolve_order().unwrap_err(),
            PluginError::MissingDependency {
                plugin: "render".into(),
                dependency: "gpu".into()
            }
        );
    }

    #[test]
    fn cycles_are_rejected_naming_their_members() {
        let r = registry(vec![
            PluginRecord::new("a").depends_on("b"),
            PluginRecord::new("b").depends_on("c"),
            PluginRecord::new("c").depends_on("a"),
            PluginRecord::new("free"),
        ]);
        assert_eq!(
            r.resolve_order().unwrap_err(),
            PluginError::Cycle(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn repeated_dependency_counts_once() {
        let r = registry(vec![
            PluginRecord::new("core"),
            PluginRecord::new("ui").depends_on("core").depends_on("core"),
        ]);
        assert_eq!(r.resolve_order().unwrap(), ["core", "ui"]);
    }

    #[test]
    fn shutdown_runs_in_reverse_start_order() {
        let journal = Journal::default();
        let mut r = PluginRegistry::new();
        r.register(Recorder::boxed(PluginRecord::new("window").depends_on("core"), &journal))
            .unwrap();
        r.register(Recorder::boxed(PluginRecord::new("core"), &journal)).unwrap();

        r.start_all().unwrap();
        assert_eq!(r.started(), ["core", "window"]);
        r.shutdown_all();
        assert!(r.started().is_empty());
        assert_eq!(
            *journal.borrow(),
            [
                "load core",
                "start core",
                "load window",
                "start window",
                "stop window",
                "unload window",
                "stop core",
                "unload core"
            ]
        );
    }

    #[test]
    fn failed_start_unwinds_what_already_started() {
        let journal = Journal::default();
        let mut r = PluginRegistry::new();
        r.register(Recorder::boxed(PluginRecord::new("core"), &journal)).unwrap();
        r.register(Box::new(Recorder {
            record: PluginRecord::new("net").depends_on("core"),
            journal: journal.clone(),
            fail_start: true,
        }))
        .unwrap();

        let err = r.start_all().unwrap_err();
        assert!(matches!(err, PluginError::Lifecycle { ref plugin, .. } if plugin == "net"));
        assert!(r.started().is_empty());
        assert_eq!(
            *journal.borrow(),
            ["load core", "start core", "load net", "unload net", "stop core", "unload core"]
        );
    }

    #[test]
    fn capabilities_are_found_by_name() {
        let r = registry(vec![
            PluginRecord::new("vk").provides("renderer"),
            PluginRecord::new("sim").provides("renderer").provides("headless"),
            PluginRecord::new("log"),
        ]);
        assert_eq!(r.find_capability("renderer"), ["sim", "vk"]);
        assert_eq!(r.find_capability("headless"), ["sim"]);
        assert!(r.find_capability("audio").is_empty());
    }

    #[test]
    fn records_parse_with_defaults() {
        #[derive(Deserialize)]
        struct Doc {
            plugins: Vec<PluginRecord>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[plugins]]
            name = "overlay"
            depends_on = ["render"]
            capabilities = ["hud"]
            "#,
        )
        .unwrap();
        let p = &doc.plugins[0];
        assert_eq!(p.version, "0.1.0");
        assert_eq!(p.depends_on, ["render"]);
        assert!(p.capabilities.contains("hud"));
    }
}

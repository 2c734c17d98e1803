//! Builtin plugins, resolved by name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use stoic_proto::PROTOCOL_VERSION;

use crate::plugin::{Plugin, PluginContext, PluginResult};

/// Does nothing; used to check that a server is up.
pub const NOOP: &str = "stoic-noop";
/// Lists registered builtin names.
pub const LIST: &str = "stoic-list";
/// Prints protocol and attach details.
pub const STATUS: &str = "stoic-status";

/// Statically registered plugins.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.plugins.keys()).finish()
    }
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` under `name`, replacing any earlier entry.
    pub fn register(&mut self, name: impl Into<String>, plugin: impl Plugin + 'static) {
        self.plugins.insert(name.into(), Arc::new(plugin));
    }

    /// Looks a builtin up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Adds `stoic-noop`, `stoic-list` and `stoic-status`.
    ///
    /// Call after registering application plugins: the listing is a
    /// snapshot taken here.
    pub fn install_builtins(&mut self, version_name: &str, attached_via: &str) {
        let mut names: Vec<String> = self.names().map(str::to_owned).collect();
        names.extend([NOOP, LIST, STATUS].map(str::to_owned));
        names.sort();
        names.dedup();
        let names = Arc::new(names);

        self.register(NOOP, |_: &mut PluginContext, _: &[String]| -> PluginResult { Ok(0) });

        let listed = Arc::clone(&names);
        self.register(
            LIST,
            move |ctx: &mut PluginContext, _: &[String]| -> PluginResult {
                for name in listed.iter() {
                    writeln!(ctx.stdout(), "{name}")?;
                }
                Ok(0)
            },
        );

        let version_name = version_name.to_owned();
        let attached_via = attached_via.to_owned();
        self.register(
            STATUS,
            move |ctx: &mut PluginContext, _: &[String]| -> PluginResult {
                let out = ctx.stdout();
                writeln!(out, "protocol-version: {PROTOCOL_VERSION}")?;
                writeln!(out, "version-name: {version_name}")?;
                writeln!(out, "attached-via: {attached_via}")?;
                writeln!(out, "embedded-plugins: [{}]", names.join(", "))?;
                Ok(0)
            },
        );
    }
}

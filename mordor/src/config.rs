//! Process-wide configuration variables.
//!
//! A flat registry of named, typed vars. Each var parses from a string
//! (so external configuration sources stay untyped) and notifies
//! registered listeners on change; the logging module wires its `log.*`
//! vars through this registry.

use std::any::Any;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// Type-erased view of a [`ConfigVar`], as stored in the registry.
pub trait AnyConfigVar: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Parse and set from a string value. `Err` carries a description
    /// of the parse failure.
    fn set_from_string(&self, value: &str) -> std::result::Result<(), String>;
    fn value_string(&self) -> String;
    fn as_any(&self) -> &dyn Any;
}

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A typed configuration variable.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T: Clone + Send + Sync + 'static> ConfigVar<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> T {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set the value and notify listeners.
    pub fn set(&self, value: T) {
        {
            let mut guard = self.value.write().unwrap_or_else(PoisonError::into_inner);
            *guard = value;
        }
        let value = self.get();
        for listener in lock(&self.listeners).iter() {
            listener(&value);
        }
    }

    /// Register a change listener. Listeners run on the thread that
    /// calls [`set`](Self::set), after the value is stored.
    pub fn monitor(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        lock(&self.listeners).push(Box::new(listener));
    }
}

impl<T> AnyConfigVar for ConfigVar<T>
where
    T: Clone + FromStr + ToString + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn set_from_string(&self, value: &str) -> std::result::Result<(), String> {
        let parsed: T = value
            .parse()
            .map_err(|_| format!("invalid value {value:?} for {}", self.name))?;
        self.set(parsed);
        Ok(())
    }

    fn value_string(&self) -> String {
        self.get().to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Entry {
    var: Arc<dyn AnyConfigVar>,
    any: Arc<dyn Any + Send + Sync>,
}

fn registry() -> &'static Mutex<HashMap<String, Entry>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Define a config var, or return the existing one with that name.
pub fn define<T>(name: &str, description: &str, default: T) -> Arc<ConfigVar<T>>
where
    T: Clone + FromStr + ToString + Send + Sync + 'static,
{
    let mut reg = lock(registry());
    if let Some(entry) = reg.get(name)
        && let Ok(existing) = entry.any.clone().downcast::<ConfigVar<T>>()
    {
        return existing;
    }
    let var = Arc::new(ConfigVar {
        name: name.to_string(),
        description: description.to_string(),
        value: RwLock::new(default),
        listeners: Mutex::new(Vec::new()),
    });
    reg.insert(
        name.to_string(),
        Entry {
            var: var.clone(),
            any: var.clone(),
        },
    );
    var
}

/// Look up a var by name.
pub fn lookup(name: &str) -> Option<Arc<dyn AnyConfigVar>> {
    lock(registry()).get(name).map(|e| e.var.clone())
}

/// Parse-and-set by name. `Err` if the var is unknown or the value does
/// not parse.
pub fn set(name: &str, value: &str) -> std::result::Result<(), String> {
    let var = lookup(name).ok_or_else(|| format!("unknown config var {name:?}"))?;
    var.set_from_string(value)
}

/// Visit every registered var.
pub fn visit(mut f: impl FnMut(&Arc<dyn AnyConfigVar>)) {
    let vars: Vec<_> = lock(registry()).values().map(|e| e.var.clone()).collect();
    for var in &vars {
        f(var);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

//! DynamicValue - a tunable that is either fixed or supplied on demand
//!
//! Components re-read their properties on every cycle so that values like the
//! concurrency level can be changed while a listener is running. A supplier that
//! panics must never take a component down, so reads go through [`DynamicValue::get_or`]
//! which falls back to the documented default.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

pub enum DynamicValue<T> {
    Fixed(T),
    Supplier(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> DynamicValue<T> {
    pub fn fixed(value: T) -> Self {
        DynamicValue::Fixed(value)
    }

    pub fn supplier<F>(supplier: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        DynamicValue::Supplier(Arc::new(supplier))
    }

    /// Read the current value. A panicking supplier unwinds into the caller.
    pub fn get(&self) -> T {
        match self {
            DynamicValue::Fixed(value) => value.clone(),
            DynamicValue::Supplier(supplier) => supplier(),
        }
    }

    /// Read the current value, using `default` if the supplier panics
    pub fn get_or(&self, name: &str, default: T) -> T {
        self.get_where(name, default, |_| true)
    }

    /// Read the current value, using `default` if the supplier panics or the
    /// value is rejected by `valid`
    pub fn get_where<P>(&self, name: &str, default: T, valid: P) -> T
    where
        P: Fn(&T) -> bool,
    {
        match self {
            DynamicValue::Fixed(value) if valid(value) => value.clone(),
            DynamicValue::Fixed(_) => default,
            DynamicValue::Supplier(supplier) => {
                match catch_unwind(AssertUnwindSafe(|| supplier())) {
                    Ok(value) if valid(&value) => value,
                    Ok(_) => default,
                    Err(_) => {
                        error!(property = name, "Property supplier panicked, using default");
                        default
                    }
                }
            }
        }
    }
}

impl<T: Clone> Clone for DynamicValue<T> {
    fn clone(&self) -> Self {
        match self {
            DynamicValue::Fixed(value) => DynamicValue::Fixed(value.clone()),
            DynamicValue::Supplier(supplier) => DynamicValue::Supplier(supplier.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for DynamicValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicValue::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            DynamicValue::Supplier(_) => f.write_str("Supplier(..)"),
        }
    }
}

impl<T> From<T> for DynamicValue<T> {
    fn from(value: T) -> Self {
        DynamicValue::Fixed(value)
    }
}

//! Purpose: Ordered property set built before an operation call.
//! Exports: `Options`, `Out`.
//! Role: Holds encoded inputs and typed output slots for `operation::call`.
//! Invariants: Inputs are encoded when set and written in insertion order.
//! Invariants: Output slots are filled all together after a successful build, or not at all.
use std::any::Any;
use std::ffi::{CStr, CString};
use std::fmt;
use std::marker::PhantomData;

use super::error::{Error, ErrorKind, Result};
use super::object::KeepAlive;
use super::value::{self, FromOutput, NativeValue, Value};

type DecodeFn = fn(&NativeValue, &[KeepAlive]) -> Option<Box<dyn Any + Send>>;

/// Typed handle to an output slot of one `Options`.
pub struct Out<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Out<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Out<T> {}

pub(crate) struct Input {
    pub(crate) name: CString,
    pub(crate) native: NativeValue,
    host: Value,
}

pub(crate) struct Output {
    pub(crate) name: CString,
    pub(crate) type_id: u32,
    pub(crate) any_enum: bool,
    pub(crate) required: bool,
    pub(crate) decode: DecodeFn,
    value: Option<Box<dyn Any + Send>>,
}

#[derive(Default)]
pub struct Options {
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    deferred: Option<Error>,
}

fn property_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("property name {name:?} contains a NUL byte"))
            .with_source(err)
    })
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input. Encoding failures are reported by the call that uses this set.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        let host = value.into();
        let encoded = property_name(name).and_then(|name| Ok((name, value::encode(&host)?)));
        match encoded {
            Ok((name, native)) => self.inputs.push(Input { name, native, host }),
            Err(err) => {
                if self.deferred.is_none() {
                    self.deferred = Some(err);
                }
            }
        }
        self
    }

    /// Add an input only when `value` is present.
    pub fn set_opt<V: Into<Value>>(&mut self, name: &str, value: Option<V>) -> &mut Self {
        if let Some(value) = value {
            self.set(name, value);
        }
        self
    }

    /// Request an output the engine must produce.
    pub fn output<T: FromOutput>(&mut self, name: &str) -> Out<T> {
        self.push_output::<T>(name, true)
    }

    /// Request an output the engine may leave unset.
    pub fn optional_output<T: FromOutput>(&mut self, name: &str) -> Out<T> {
        self.push_output::<T>(name, false)
    }

    fn push_output<T: FromOutput>(&mut self, name: &str, required: bool) -> Out<T> {
        let index = self.outputs.len();
        match property_name(name) {
            Ok(name) => self.outputs.push(Output {
                name,
                type_id: T::TYPE_ID,
                any_enum: T::ANY_ENUM,
                required,
                decode: value::decode_erased::<T>,
                value: None,
            }),
            Err(err) => {
                if self.deferred.is_none() {
                    self.deferred = Some(err);
                }
            }
        }
        Out {
            index,
            _marker: PhantomData,
        }
    }

    /// Move a populated output out of its slot.
    pub fn take<T: FromOutput>(&mut self, out: Out<T>) -> Result<T> {
        let name = self
            .outputs
            .get(out.index)
            .map(|output| output.name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.take_opt(out).ok_or_else(|| {
            Error::new(ErrorKind::OperationFailed)
                .with_message(format!("output \"{name}\" is not populated"))
        })
    }

    pub fn take_opt<T: FromOutput>(&mut self, out: Out<T>) -> Option<T> {
        let slot = self.outputs.get_mut(out.index)?;
        let value = slot.value.take()?;
        match value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(value) => {
                slot.value = Some(value);
                None
            }
        }
    }

    /// Number of output slots currently holding a value.
    pub fn populated_outputs(&self) -> usize {
        self.outputs
            .iter()
            .filter(|output| output.value.is_some())
            .count()
    }

    pub(crate) fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub(crate) fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// The first input or output that failed to encode. It stays recorded, so
    /// every call made with this set fails the same way.
    pub(crate) fn deferred(&self) -> Option<Error> {
        self.deferred.as_ref().map(|err| {
            let copy = Error::new(err.kind());
            match err.message() {
                Some(message) => copy.with_message(message),
                None => copy,
            }
        })
    }

    /// Shared handles of every object input, for outputs derived from them.
    pub(crate) fn keep_alive(&self) -> Vec<KeepAlive> {
        self.inputs
            .iter()
            .flat_map(|input| input.host.keep_alive())
            .collect()
    }

    /// Fill every slot at once; `decoded` is indexed like the outputs.
    pub(crate) fn commit(&mut self, decoded: Vec<Option<Box<dyn Any + Send>>>) {
        for (output, value) in self.outputs.iter_mut().zip(decoded) {
            output.value = value;
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<(&CStr, &Value)> = self
            .inputs
            .iter()
            .map(|input| (input.name.as_c_str(), &input.host))
            .collect();
        let outputs: Vec<&CStr> = self
            .outputs
            .iter()
            .map(|output| output.name.as_c_str())
            .collect();
        f.debug_struct("Options")
            .field("inputs", &inputs)
            .field("outputs", &outputs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_names_are_deferred_to_the_call() {
        let mut options = Options::new();
        options.set("wid\0th", 3);
        let err = options.deferred().expect("deferred error");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(options.inputs().is_empty());
    }

    #[test]
    fn set_opt_skips_absent_values() {
        let mut options = Options::new();
        options.set_opt("bands", None::<i32>).set_opt("width", Some(4));
        assert_eq!(options.inputs().len(), 1);
        assert_eq!(options.inputs()[0].name.as_c_str(), c"width");
    }

    #[test]
    fn take_before_population_reports_the_slot() {
        let mut options = Options::new();
        let out = options.output::<f64>("out");
        assert_eq!(options.populated_outputs(), 0);
        let err = options.take(out).expect_err("empty slot");
        assert_eq!(err.message(), Some("output \"out\" is not populated"));
    }
}

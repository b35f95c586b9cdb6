//! Named argument binding.
//!
//! A parallel function declares its parameters up front with a
//! [`FunctionSignature`]. Each call's positional and keyword values
//! ([`CallArgs`]) are then assigned to those names, producing
//! [`NamedArguments`] that partitioning functions can split, rewrite and merge
//! by name.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Type-erased, cheaply cloneable argument value.
#[derive(Clone)]
pub struct ArgValue(Arc<dyn Any + Send + Sync>);

impl ArgValue {
    /// Lifts a concrete value into an argument value.
    pub fn new<A: Any + Send + Sync>(a: A) -> Self {
        ArgValue(Arc::new(a))
    }

    /// Wraps an already shared value without copying it.
    pub fn from_arc<A: Any + Send + Sync>(a: Arc<A>) -> Self {
        ArgValue(a)
    }

    /// Borrows the value if it holds an `A`.
    pub fn downcast_ref<A: Any>(&self) -> Option<&A> {
        self.0.downcast_ref::<A>()
    }

    /// Whether the value holds an `A`.
    pub fn is<A: Any>(&self) -> bool {
        self.0.is::<A>()
    }

    /// Returns the shared value if it holds an `A`.
    pub fn downcast_arc<A: Any + Send + Sync>(&self) -> Option<Arc<A>> {
        self.0.clone().downcast::<A>().ok()
    }
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ArgValue(..)")
    }
}

/// How a declared parameter may be assigned.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum ParameterKind {
    /// Assignable by position or by name.
    PositionalOrKeyword,
    /// Assignable by name only.
    KeywordOnly,
}

/// One declared parameter of a wrapped function.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct Parameter {
    /// Name the parameter is bound under.
    pub name: String,
    /// How values may be assigned to it.
    pub kind: ParameterKind,
    /// Whether the parameter may be left unassigned.
    pub has_default: bool,
}

/// Explicit parameter list of a wrapped function.
#[derive(Debug,Clone,Default,PartialEq,Eq)]
pub struct FunctionSignature {
    params: Vec<Parameter>,
    var_args: bool,
    var_kwargs: bool,
}

impl FunctionSignature {
    /// An empty signature.
    pub fn new() -> Self {
        FunctionSignature::default()
    }

    /// Builds a signature made of required positional-or-keyword parameters.
    pub fn positional<S: AsRef<str>>(names: &[S]) -> Self {
        names.iter().fold(FunctionSignature::new(), |sig, n| sig.param(n.as_ref()))
    }

    /// Adds a required positional-or-keyword parameter.
    pub fn param(self, name: &str) -> Self {
        self.push(name, ParameterKind::PositionalOrKeyword, false)
    }

    /// Adds a positional-or-keyword parameter with a default value.
    pub fn optional_param(self, name: &str) -> Self {
        self.push(name, ParameterKind::PositionalOrKeyword, true)
    }

    /// Adds a required keyword-only parameter.
    pub fn keyword_only(self, name: &str) -> Self {
        self.push(name, ParameterKind::KeywordOnly, false)
    }

    /// Adds a keyword-only parameter with a default value.
    pub fn optional_keyword_only(self, name: &str) -> Self {
        self.push(name, ParameterKind::KeywordOnly, true)
    }

    /// Accepts any number of extra positional values.
    pub fn var_args(mut self) -> Self {
        self.var_args = true;
        self
    }

    /// Accepts keyword values with undeclared names.
    pub fn var_kwargs(mut self) -> Self {
        self.var_kwargs = true;
        self
    }

    fn push(mut self, name: &str, kind: ParameterKind, has_default: bool) -> Self {
        self.params.push(Parameter { name: name.to_owned(), kind, has_default });
        self
    }

    /// Declared parameters, in declaration order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    /// Whether extra positional values are accepted.
    pub fn has_var_args(&self) -> bool {
        self.var_args
    }

    /// Whether undeclared keyword values are accepted.
    pub fn has_var_kwargs(&self) -> bool {
        self.var_kwargs
    }

    /// Rejects signatures that can never be bound consistently.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for p in self.params.iter() {
            if !seen.insert(p.name.as_str()) {
                return Err(Error::Signature(format!("duplicate parameter name: {}", p.name)));
            }
        }
        Ok(())
    }

    fn positional_params(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter().filter(|p| p.kind == ParameterKind::PositionalOrKeyword)
    }

    /// Names the values of a call according to this signature.
    ///
    /// Fails if there are excess positional values without a variadic sink,
    /// if a parameter is assigned twice, if an undeclared keyword is passed
    /// without variadic keywords, or if a required parameter is left
    /// unassigned.
    pub fn assign(&self, call: CallArgs) -> Result<NamedArguments> {
        let CallArgs { positional, keyword } = call;

        let n_positional = self.positional_params().count();
        let mut values = positional.into_iter();

        let args: Vec<(String, ArgValue)> = self.positional_params()
            .zip(values.by_ref())
            .map(|(p, v)| (p.name.clone(), v))
            .collect();

        let var_args: Vec<ArgValue> = values.collect();
        if !var_args.is_empty() && !self.var_args {
            return Err(Error::Signature(format!(
                "expected {} positional arguments, got {}", n_positional, n_positional + var_args.len())));
        }

        let mut kwargs = BTreeMap::new();
        let mut double_assigned = Vec::new();
        for (name, value) in keyword {
            if args.iter().any(|(n, _)| *n == name) || kwargs.contains_key(&name) {
                double_assigned.push(name);
            } else {
                kwargs.insert(name, value);
            }
        }
        if !double_assigned.is_empty() {
            return Err(Error::Signature(format!(
                "parameter(s) assigned twice: {}", double_assigned.join(", "))));
        }

        if !self.var_kwargs {
            let invalid: Vec<&str> = kwargs.keys()
                .filter(|k| !self.params.iter().any(|p| &p.name == *k))
                .map(|k| k.as_str())
                .collect();
            if !invalid.is_empty() {
                return Err(Error::Signature(format!(
                    "invalid keyword parameter(s): {}", invalid.join(", "))));
            }
        }

        let unassigned: Vec<&str> = self.params.iter()
            .filter(|p| !p.has_default)
            .filter(|p| !args.iter().any(|(n, _)| *n == p.name) && !kwargs.contains_key(&p.name))
            .map(|p| p.name.as_str())
            .collect();
        if !unassigned.is_empty() {
            return Err(Error::Signature(format!(
                "unassigned parameter(s): {}", unassigned.join(", "))));
        }

        let declared = Arc::new(self.positional_params().map(|p| p.name.clone()).collect());
        Ok(NamedArguments { args, kwargs, var_args, declared })
    }
}

/// The raw values of one call, before binding.
#[derive(Debug,Clone,Default)]
pub struct CallArgs {
    positional: Vec<ArgValue>,
    keyword: Vec<(String, ArgValue)>,
}

impl CallArgs {
    /// A call without any value.
    pub fn new() -> Self {
        CallArgs::default()
    }

    /// Appends a positional value.
    pub fn arg<A: Any + Send + Sync>(self, a: A) -> Self {
        self.arg_value(ArgValue::new(a))
    }

    /// Appends an already erased positional value.
    pub fn arg_value(mut self, a: ArgValue) -> Self {
        self.positional.push(a);
        self
    }

    /// Adds a keyword value.
    pub fn kwarg<A: Any + Send + Sync>(self, name: &str, a: A) -> Self {
        self.kwarg_value(name, ArgValue::new(a))
    }

    /// Adds an already erased keyword value.
    pub fn kwarg_value(mut self, name: &str, a: ArgValue) -> Self {
        self.keyword.push((name.to_owned(), a));
        self
    }

    /// Positional values, in call order.
    pub fn positional(&self) -> &[ArgValue] {
        &self.positional
    }

    /// Keyword values, in call order.
    pub fn keyword(&self) -> &[(String, ArgValue)] {
        &self.keyword
    }
}

/// Argument values of one call, associated with their parameter names.
///
/// Positional names keep their declaration order. Operations never mutate in
/// place; they return new instances.
#[derive(Debug,Clone,Default)]
pub struct NamedArguments {
    args: Vec<(String, ArgValue)>,
    kwargs: BTreeMap<String, ArgValue>,
    var_args: Vec<ArgValue>,
    // Positional parameter names in declaration order, shared by every
    // instance split from the same call
    declared: Arc<Vec<String>>,
}

impl NamedArguments {
    /// An empty argument set.
    pub fn new() -> Self {
        NamedArguments::default()
    }

    /// Builds an argument set from already named values.
    ///
    /// The order of `args` is taken as the declaration order of the
    /// positional names.
    pub fn from_parts(
        args: Vec<(String, ArgValue)>,
        kwargs: BTreeMap<String, ArgValue>,
        var_args: Vec<ArgValue>
    ) -> Result<Self> {
        if let Some((name, _)) = args.iter().find(|(n, _)| kwargs.contains_key(n)) {
            return Err(Error::Signature(format!("parameter assigned twice: {}", name)));
        }
        let declared = Arc::new(args.iter().map(|(n, _)| n.clone()).collect());
        Ok(NamedArguments { args, kwargs, var_args, declared })
    }

    /// The value bound to `name`, positional or keyword.
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.args.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.kwargs.get(name))
    }

    /// Typed access to an argument, failing with a task error when the name
    /// is unknown or the value has another type.
    pub fn get_as<A: Any>(&self, name: &str) -> Result<&A> {
        let value = self.get(name)
            .ok_or_else(|| Error::task(format!("unknown argument name: {}", name)))?;
        value.downcast_ref::<A>()
            .ok_or_else(|| Error::task(format!("argument `{}` has an unexpected type", name)))
    }

    /// Whether a value is bound to `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All argument names, positional first.
    pub fn keys(&self) -> Vec<&str> {
        self.args.iter()
            .map(|(n, _)| n.as_str())
            .chain(self.kwargs.keys().map(|k| k.as_str()))
            .collect()
    }

    /// Named positional values, in declaration order.
    pub fn positional(&self) -> &[(String, ArgValue)] {
        &self.args
    }

    /// Keyword values, by name.
    pub fn keyword(&self) -> &BTreeMap<String, ArgValue> {
        &self.kwargs
    }

    /// Extra positional values collected by a variadic signature.
    pub fn var_args(&self) -> &[ArgValue] {
        &self.var_args
    }

    /// Number of values, variadic ones included.
    pub fn len(&self) -> usize {
        self.args.len() + self.kwargs.len() + self.var_args.len()
    }

    /// Whether no value is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the arguments matching `names`, and the remaining ones.
    ///
    /// Variadic values always land on the excluded side.
    pub fn split<S: AsRef<str>>(&self, names: &[S]) -> (NamedArguments, NamedArguments) {
        let selected = |n: &str| names.iter().any(|s| s.as_ref() == n);

        let (inc_args, exc_args): (Vec<_>, Vec<_>) = self.args.iter()
            .cloned()
            .partition(|(n, _)| selected(n.as_str()));
        let (inc_kwargs, exc_kwargs): (BTreeMap<_, _>, BTreeMap<_, _>) = self.kwargs.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .partition(|(n, _)| selected(n.as_str()));

        let includes = NamedArguments {
            args: inc_args,
            kwargs: inc_kwargs,
            var_args: Vec::new(),
            declared: self.declared.clone()
        };
        let excludes = NamedArguments {
            args: exc_args,
            kwargs: exc_kwargs,
            var_args: self.var_args.clone(),
            declared: self.declared.clone()
        };
        (includes, excludes)
    }

    /// Returns a copy with some named values replaced.
    pub fn reassigned<I>(&self, changes: I) -> Result<NamedArguments>
            where I: IntoIterator<Item = (String, ArgValue)> {
        let mut out = self.clone();
        for (name, value) in changes {
            if let Some(slot) = out.args.iter_mut().find(|(n, _)| *n == name) {
                slot.1 = value;
            } else if let Some(slot) = out.kwargs.get_mut(&name) {
                *slot = value;
            } else {
                return Err(Error::Signature(format!("invalid argument key: `{}`", name)));
            }
        }
        Ok(out)
    }

    /// Merges two argument sets.
    ///
    /// Positional names keep `self`'s value and are ordered by their declared
    /// position; keyword values from `other` win. Variadic values are
    /// concatenated.
    pub fn merge(&self, other: &NamedArguments) -> NamedArguments {
        let mut args = self.args.clone();
        for (name, value) in other.args.iter() {
            if !args.iter().any(|(n, _)| n == name) {
                args.push((name.clone(), value.clone()));
            }
        }
        let declared = if self.declared.len() >= other.declared.len() {
            self.declared.clone()
        } else {
            other.declared.clone()
        };
        // Stable: names missing from the declaration keep their relative order at the end
        args.sort_by_key(|(n, _)| declared.iter().position(|d| d == n).unwrap_or(usize::MAX));

        let mut kwargs = self.kwargs.clone();
        for (name, value) in other.kwargs.iter() {
            kwargs.insert(name.clone(), value.clone());
        }

        let mut var_args = self.var_args.clone();
        var_args.extend(other.var_args.iter().cloned());

        NamedArguments { args, kwargs, var_args, declared }
    }
}

#[cfg(test)]
mod args_test {
    use super::*;

    fn signature() -> FunctionSignature {
        FunctionSignature::new()
            .param("values")
            .param("constant")
            .optional_keyword_only("scale")
    }

    #[test]
    fn test_assign_positional_and_keyword() {
        let named = signature()
            .assign(CallArgs::new().arg(vec![1, 2, 3]).kwarg("constant", 2i64))
            .unwrap();
        assert_eq!(named.keys(), vec!["values", "constant"]);
        assert_eq!(named.get_as::<Vec<i32>>("values").unwrap(), &vec![1, 2, 3]);
        assert_eq!(*named.get_as::<i64>("constant").unwrap(), 2);
        assert!(named.positional().iter().all(|(n, _)| n == "values"));
    }

    #[test]
    fn test_assign_errors() {
        let sig = signature();
        let too_many = sig.assign(CallArgs::new().arg(1).arg(2).arg(3));
        assert!(matches!(too_many, Err(Error::Signature(_))));

        let twice = sig.assign(CallArgs::new().arg(1).arg(2).kwarg("values", 3));
        assert!(matches!(twice, Err(Error::Signature(ref m)) if m.contains("twice")));

        let unknown = sig.assign(CallArgs::new().arg(1).arg(2).kwarg("other", 3));
        assert!(matches!(unknown, Err(Error::Signature(ref m)) if m.contains("invalid keyword")));

        let missing = sig.assign(CallArgs::new().arg(1));
        assert!(matches!(missing, Err(Error::Signature(ref m)) if m.contains("constant")));
    }

    #[test]
    fn test_var_args() {
        let sig = FunctionSignature::positional(&["a"]).var_args().var_kwargs();
        let named = sig.assign(CallArgs::new().arg(1).arg(2).arg(3).kwarg("extra", 4)).unwrap();
        assert_eq!(named.var_args().len(), 2);
        assert!(named.contains("extra"));
    }

    #[test]
    fn test_split_is_disjoint() {
        let sig = FunctionSignature::positional(&["a", "b"]).var_args().keyword_only("c");
        let named = sig.assign(CallArgs::new().arg(1).arg(2).arg(3).kwarg("c", 4)).unwrap();

        let (inc, exc) = named.split(&["a", "c"]);
        assert_eq!(inc.keys(), vec!["a", "c"]);
        assert_eq!(exc.keys(), vec!["b"]);
        assert!(inc.var_args().is_empty());
        assert_eq!(exc.var_args().len(), 1);
        assert_eq!(inc.len() + exc.len(), named.len());
    }

    #[test]
    fn test_merge_bias() {
        let left = NamedArguments::from_parts(
            vec![("a".into(), ArgValue::new(1)), ("b".into(), ArgValue::new(2))],
            vec![("k".to_owned(), ArgValue::new(10))].into_iter().collect(),
            vec![]).unwrap();
        let right = NamedArguments::from_parts(
            vec![("a".into(), ArgValue::new(100)), ("c".into(), ArgValue::new(3))],
            vec![("k".to_owned(), ArgValue::new(20))].into_iter().collect(),
            vec![]).unwrap();

        let merged = left.merge(&right);
        assert_eq!(merged.keys(), vec!["a", "b", "c", "k"]);
        assert_eq!(*merged.get_as::<i32>("a").unwrap(), 1);
        assert_eq!(*merged.get_as::<i32>("k").unwrap(), 20);
    }

    #[test]
    fn test_reassigned() {
        let named = signature().assign(CallArgs::new().arg(1).arg(2)).unwrap();
        let changed = named.reassigned(vec![("constant".to_owned(), ArgValue::new(5))]).unwrap();
        assert_eq!(*changed.get_as::<i32>("constant").unwrap(), 5);
        assert_eq!(*named.get_as::<i32>("constant").unwrap(), 2);
        assert!(named.reassigned(vec![("nope".to_owned(), ArgValue::new(0))]).is_err());
    }

    #[test]
    fn test_merge_restores_declaration_order() {
        let sig = FunctionSignature::positional(&["a", "b", "c"]);
        let named = sig.assign(CallArgs::new().arg(1).arg(2).arg(3)).unwrap();

        let (partitioned, rest) = named.split(&["a", "c"]);
        assert_eq!(rest.keys(), vec!["b"]);

        let merged = rest.merge(&partitioned);
        assert_eq!(merged.keys(), vec!["a", "b", "c"]);
        let values: Vec<i32> = merged.positional().iter()
            .map(|(_, v)| *v.downcast_ref::<i32>().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }
}

//! Stateless built-in transforms.

use super::Transform;
use crate::error::TransformError;
use crate::record::Record;

fn utf8_value<'a>(record: &'a Record) -> Result<&'a str, TransformError> {
    record.value_str().ok_or_else(|| TransformError::Malformed {
        partition: record.partition(),
        offset: record.offset(),
        message: "value is not valid UTF-8".into(),
    })
}

/// Passes every record through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transform for Identity {
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, TransformError> {
        Ok(vec![record.clone()])
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// Uppercases UTF-8 values. Non-UTF-8 values are malformed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uppercase;

impl Transform for Uppercase {
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, TransformError> {
        let value = utf8_value(record)?;
        Ok(vec![record.with_value(value.to_uppercase())])
    }

    fn name(&self) -> &str {
        "uppercase"
    }
}

/// Lowercases UTF-8 values. Non-UTF-8 values are malformed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lowercase;

impl Transform for Lowercase {
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, TransformError> {
        let value = utf8_value(record)?;
        Ok(vec![record.with_value(value.to_lowercase())])
    }

    fn name(&self) -> &str {
        "lowercase"
    }
}

/// Replaces each value with `f(value)`, keeping key and position.
pub struct MapValues<F> {
    name: String,
    f: F,
}

impl<F> MapValues<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Transform for MapValues<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send,
{
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, TransformError> {
        Ok(vec![record.with_value((self.f)(record.value()))])
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Keeps records matching a predicate and drops the rest.
pub struct Filter<P> {
    name: String,
    predicate: P,
}

impl<P> Filter<P>
where
    P: Fn(&Record) -> bool + Send,
{
    pub fn new(name: impl Into<String>, predicate: P) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<P> Transform for Filter<P>
where
    P: Fn(&Record) -> bool + Send,
{
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, TransformError> {
        if (self.predicate)(record) {
            Ok(vec![record.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Maps each record to any number of derived records.
pub struct FlatMap<F> {
    name: String,
    f: F,
}

impl<F> FlatMap<F>
where
    F: FnMut(&Record) -> Result<Vec<Record>, TransformError> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Transform for FlatMap<F>
where
    F: FnMut(&Record) -> Result<Vec<Record>, TransformError> + Send,
{
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, TransformError> {
        (self.f)(record)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs transforms in sequence, feeding each stage's outputs to the next.
pub struct Chain {
    name: String,
    stages: Vec<Box<dyn Transform>>,
}

impl Chain {
    pub fn new(stages: Vec<Box<dyn Transform>>) -> Self {
        let name = stages
            .iter()
            .map(|s| s.name().to_string())
            .collect::<Vec<_>>()
            .join("|");
        Self { name, stages }
    }
}

impl Transform for Chain {
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, TransformError> {
        let mut current = vec![record.clone()];
        for stage in &mut self.stages {
            let mut next = Vec::with_capacity(current.len());
            for r in &current {
                next.extend(stage.apply(r)?);
            }
            if next.is_empty() {
                return Ok(next);
            }
            current = next;
        }
        Ok(current)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uppercase_keeps_key_and_position() {
        let record = Record::new(0, 10, "hello").with_key("a");
        let out = Uppercase.apply(&record).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value(), b"HELLO");
        assert_eq!(out[0].key_str(), Some("a"));
        assert_eq!(out[0].offset(), 10);
    }

    #[test]
    fn test_uppercase_rejects_invalid_utf8() {
        let record = Record::new(2, 4, vec![0xff, 0xfe]);
        match Uppercase.apply(&record) {
            Err(TransformError::Malformed {
                partition, offset, ..
            }) => {
                assert_eq!(partition, 2);
                assert_eq!(offset, 4);
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_apply_twice_is_deterministic() {
        let record = Record::new(0, 1, "Straße").with_key("k");
        let mut upper = Uppercase;
        assert_eq!(upper.apply(&record).unwrap(), upper.apply(&record).unwrap());

        let mut lower = Lowercase;
        assert_eq!(lower.apply(&record).unwrap(), lower.apply(&record).unwrap());
    }

    #[test]
    fn test_filter_drops_records() {
        let mut filter = Filter::new("non-empty", |r: &Record| !r.value().is_empty());
        assert!(filter.apply(&Record::new(0, 1, "")).unwrap().is_empty());
        assert_eq!(filter.apply(&Record::new(0, 2, "x")).unwrap().len(), 1);
    }

    #[test]
    fn test_flat_map_expands() {
        let mut split = FlatMap::new("split", |r: &Record| {
            Ok(r.value()
                .split(|b| *b == b' ')
                .map(|word| r.with_value(word.to_vec()))
                .collect())
        });
        let out = split.apply(&Record::new(0, 5, "a b c")).unwrap();

        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.offset() == 5));
        assert_eq!(out[2].value(), b"c");
    }

    #[test]
    fn test_map_values() {
        let mut reverse = MapValues::new("reverse", |v: &[u8]| v.iter().rev().copied().collect());
        let out = reverse.apply(&Record::new(0, 0, "abc")).unwrap();
        assert_eq!(out[0].value(), b"cba");
        assert_eq!(reverse.name(), "reverse");
    }

    #[test]
    fn test_chain_composes_in_order() {
        let mut chain = Chain::new(vec![
            Box::new(Filter::new("no-x", |r: &Record| r.value() != b"x")),
            Box::new(Uppercase),
        ]);
        assert_eq!(chain.name(), "no-x|uppercase");

        let out = chain.apply(&Record::new(0, 1, "abc")).unwrap();
        assert_eq!(out[0].value(), b"ABC");
        assert!(chain.apply(&Record::new(0, 2, "x")).unwrap().is_empty());
    }

    #[test]
    fn test_chain_propagates_errors() {
        let mut chain = Chain::new(vec![Box::new(Identity), Box::new(Uppercase)]);
        assert!(chain.apply(&Record::new(0, 1, vec![0xc3])).is_err());
    }
}

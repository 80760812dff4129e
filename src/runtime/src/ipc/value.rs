//! Self-describing IPC values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use uuid::Uuid;
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::RichError;

/// Type tag of an [`IpcValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcTag {
    Null,
    Bool,
    Int64,
    Uint64,
    Double,
    String,
    Data,
    Date,
    Uuid,
    Array,
    Dictionary,
    Fd,
    Error,
}

impl IpcTag {
    pub fn as_str(self) -> &'static str {
        match self {
            IpcTag::Null => "null",
            IpcTag::Bool => "bool",
            IpcTag::Int64 => "int64",
            IpcTag::Uint64 => "uint64",
            IpcTag::Double => "double",
            IpcTag::String => "string",
            IpcTag::Data => "data",
            IpcTag::Date => "date",
            IpcTag::Uuid => "uuid",
            IpcTag::Array => "array",
            IpcTag::Dictionary => "dictionary",
            IpcTag::Fd => "fd",
            IpcTag::Error => "error",
        }
    }
}

impl fmt::Display for IpcTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file descriptor carried in a message.
///
/// Clones share the descriptor. Two values are equal when they refer to the
/// same open file (same device and inode), not when the numbers match.
#[derive(Clone)]
pub struct IpcFd(Arc<OwnedFd>);

impl IpcFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self(Arc::new(fd))
    }

    /// A fresh descriptor for the same open file.
    pub fn try_clone_owned(&self) -> Result<OwnedFd> {
        Ok(self.0.try_clone()?)
    }

    fn identity(&self) -> Option<(u64, u64)> {
        // SAFETY: fstat only writes into the zeroed struct we pass it.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.0.as_raw_fd(), &mut stat) };
        (rc == 0).then_some((stat.st_dev as u64, stat.st_ino as u64))
    }
}

impl AsFd for IpcFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl PartialEq for IpcFd {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for IpcFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpcFd({})", self.0.as_raw_fd())
    }
}

/// Tagged message value.
///
/// Dictionaries are keyed by string with unique keys; arrays are ordered.
/// A value is mutable while the sender builds it and is moved into the
/// session when sent.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcValue {
    Null,
    Bool(bool),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    Data(Vec<u8>),
    Date(DateTime<Utc>),
    Uuid(Uuid),
    Array(Vec<IpcValue>),
    Dictionary(BTreeMap<String, IpcValue>),
    Fd(IpcFd),
    Error(RichError),
}

/// Key of one container entry, as passed to [`IpcValue::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKey<'a> {
    Index(usize),
    Key(&'a str),
}

macro_rules! accessors {
    ($( $as_fn:ident, $get_fn:ident, $at_fn:ident => $ty:ty, $tag:ident, |$v:ident| $extract:expr; )*) => {
        $(
            pub fn $as_fn(&self) -> Result<$ty> {
                match self {
                    IpcValue::$tag($v) => Ok($extract),
                    other => Err(BridgeError::type_mismatch(IpcTag::$tag, other.tag())),
                }
            }

            /// Typed dictionary lookup; `None` when the key is absent.
            pub fn $get_fn(&self, key: &str) -> Result<Option<$ty>> {
                self.get(key)?.map(IpcValue::$as_fn).transpose()
            }

            /// Typed array lookup; `None` when out of bounds.
            pub fn $at_fn(&self, index: usize) -> Result<Option<$ty>> {
                self.at(index)?.map(IpcValue::$as_fn).transpose()
            }
        )*
    };
}

impl IpcValue {
    pub fn dictionary() -> Self {
        IpcValue::Dictionary(BTreeMap::new())
    }

    pub fn array() -> Self {
        IpcValue::Array(Vec::new())
    }

    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        IpcValue::Data(bytes.into())
    }

    pub fn fd(fd: OwnedFd) -> Self {
        IpcValue::Fd(IpcFd::new(fd))
    }

    pub fn now() -> Self {
        IpcValue::Date(Utc::now())
    }

    pub fn tag(&self) -> IpcTag {
        match self {
            IpcValue::Null => IpcTag::Null,
            IpcValue::Bool(_) => IpcTag::Bool,
            IpcValue::Int64(_) => IpcTag::Int64,
            IpcValue::Uint64(_) => IpcTag::Uint64,
            IpcValue::Double(_) => IpcTag::Double,
            IpcValue::String(_) => IpcTag::String,
            IpcValue::Data(_) => IpcTag::Data,
            IpcValue::Date(_) => IpcTag::Date,
            IpcValue::Uuid(_) => IpcTag::Uuid,
            IpcValue::Array(_) => IpcTag::Array,
            IpcValue::Dictionary(_) => IpcTag::Dictionary,
            IpcValue::Fd(_) => IpcTag::Fd,
            IpcValue::Error(_) => IpcTag::Error,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, IpcValue::Null)
    }

    fn as_dictionary_mut(&mut self) -> Result<&mut BTreeMap<String, IpcValue>> {
        match self {
            IpcValue::Dictionary(map) => Ok(map),
            other => Err(BridgeError::type_mismatch(IpcTag::Dictionary, other.tag())),
        }
    }

    fn as_array_mut(&mut self) -> Result<&mut Vec<IpcValue>> {
        match self {
            IpcValue::Array(items) => Ok(items),
            other => Err(BridgeError::type_mismatch(IpcTag::Array, other.tag())),
        }
    }

    /// Set `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<IpcValue>) -> Result<()> {
        self.as_dictionary_mut()?.insert(key.into(), value.into());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<IpcValue>> {
        Ok(self.as_dictionary_mut()?.remove(key))
    }

    pub fn push(&mut self, value: impl Into<IpcValue>) -> Result<()> {
        self.as_array_mut()?.push(value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<&IpcValue>> {
        Ok(self.as_dictionary()?.get(key))
    }

    pub fn at(&self, index: usize) -> Result<Option<&IpcValue>> {
        Ok(self.as_array()?.get(index))
    }

    /// Entry count of a dictionary or array.
    pub fn len(&self) -> Result<usize> {
        match self {
            IpcValue::Dictionary(map) => Ok(map.len()),
            IpcValue::Array(items) => Ok(items.len()),
            other => Err(BridgeError::type_mismatch("container", other.tag())),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Visit every entry of a container until `f` returns `false`.
    ///
    /// Returns whether the whole container was visited. Dictionaries are
    /// visited in key order.
    pub fn apply<'a>(&'a self, mut f: impl FnMut(EntryKey<'a>, &'a IpcValue) -> bool) -> Result<bool> {
        match self {
            IpcValue::Dictionary(map) => Ok(map.iter().all(|(k, v)| f(EntryKey::Key(k), v))),
            IpcValue::Array(items) => Ok(items
                .iter()
                .enumerate()
                .all(|(i, v)| f(EntryKey::Index(i), v))),
            other => Err(BridgeError::type_mismatch("container", other.tag())),
        }
    }

    /// Empty reply dictionary for a received dictionary message.
    pub fn create_reply(&self) -> Result<IpcValue> {
        self.as_dictionary()?;
        Ok(IpcValue::dictionary())
    }

    /// Copy for transmission: descriptors are duplicated so the receiver
    /// owns its own, everything else is copied by value.
    pub fn duplicate(&self) -> Result<IpcValue> {
        Ok(match self {
            IpcValue::Fd(fd) => IpcValue::Fd(IpcFd::new(fd.try_clone_owned()?)),
            IpcValue::Array(items) => IpcValue::Array(
                items
                    .iter()
                    .map(IpcValue::duplicate)
                    .collect::<Result<Vec<_>>>()?,
            ),
            IpcValue::Dictionary(map) => IpcValue::Dictionary(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.duplicate()?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            ),
            other => other.clone(),
        })
    }

    accessors! {
        as_bool, get_bool, at_bool => bool, Bool, |v| *v;
        as_i64, get_i64, at_i64 => i64, Int64, |v| *v;
        as_u64, get_u64, at_u64 => u64, Uint64, |v| *v;
        as_f64, get_f64, at_f64 => f64, Double, |v| *v;
        as_str, get_string, at_string => &str, String, |v| v.as_str();
        as_data, get_data, at_data => &[u8], Data, |v| v.as_slice();
        as_date, get_date, at_date => DateTime<Utc>, Date, |v| *v;
        as_uuid, get_uuid, at_uuid => Uuid, Uuid, |v| *v;
        as_array, get_array, at_array => &[IpcValue], Array, |v| v.as_slice();
        as_dictionary, get_dictionary, at_dictionary => &BTreeMap<String, IpcValue>, Dictionary, |v| v;
        as_fd, get_fd, at_fd => &IpcFd, Fd, |v| v;
        as_error, get_error, at_error => &RichError, Error, |v| v;
    }
}

impl From<bool> for IpcValue {
    fn from(v: bool) -> Self {
        IpcValue::Bool(v)
    }
}

impl From<i64> for IpcValue {
    fn from(v: i64) -> Self {
        IpcValue::Int64(v)
    }
}

impl From<u64> for IpcValue {
    fn from(v: u64) -> Self {
        IpcValue::Uint64(v)
    }
}

impl From<f64> for IpcValue {
    fn from(v: f64) -> Self {
        IpcValue::Double(v)
    }
}

impl From<&str> for IpcValue {
    fn from(v: &str) -> Self {
        IpcValue::String(v.to_string())
    }
}

impl From<String> for IpcValue {
    fn from(v: String) -> Self {
        IpcValue::String(v)
    }
}

impl From<Uuid> for IpcValue {
    fn from(v: Uuid) -> Self {
        IpcValue::Uuid(v)
    }
}

impl From<DateTime<Utc>> for IpcValue {
    fn from(v: DateTime<Utc>) -> Self {
        IpcValue::Date(v)
    }
}

impl From<RichError> for IpcValue {
    fn from(v: RichError) -> Self {
        IpcValue::Error(v)
    }
}

impl From<Vec<IpcValue>> for IpcValue {
    fn from(v: Vec<IpcValue>) -> Self {
        IpcValue::Array(v)
    }
}

impl From<IpcFd> for IpcValue {
    fn from(v: IpcFd) -> Self {
        IpcValue::Fd(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_dictionary_access() {
        let mut dict = IpcValue::dictionary();
        dict.insert("name", "vm-1").unwrap();
        dict.insert("cpus", 4u64).unwrap();

        assert_eq!(dict.get_string("name").unwrap(), Some("vm-1"));
        assert_eq!(dict.get_u64("cpus").unwrap(), Some(4));
        assert_eq!(dict.get_u64("missing").unwrap(), None);

        let err = dict.get_i64("cpus").unwrap_err();
        assert!(matches!(
            err,
            BridgeError::TypeMismatch { ref expected, ref found } if expected == "int64" && found == "uint64"
        ));
    }

    #[test]
    fn test_accessor_on_wrong_container() {
        let mut array = IpcValue::array();
        array.push(true).unwrap();
        assert_eq!(array.at_bool(0).unwrap(), Some(true));
        assert_eq!(array.at_bool(1).unwrap(), None);
        assert!(matches!(array.get("k"), Err(BridgeError::TypeMismatch { .. })));
        assert!(matches!(
            IpcValue::from(1i64).insert("k", 1i64),
            Err(BridgeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_insert_replaces_existing_key() {
        let mut dict = IpcValue::dictionary();
        dict.insert("k", 1i64).unwrap();
        dict.insert("k", "two").unwrap();
        assert_eq!(dict.len().unwrap(), 1);
        assert_eq!(dict.get_string("k").unwrap(), Some("two"));
    }

    #[test]
    fn test_apply_stops_early() {
        let array = IpcValue::Array((0..10i64).map(IpcValue::from).collect());
        let mut visited = Vec::new();
        let completed = array
            .apply(|key, value| {
                visited.push((key, value.as_i64().unwrap()));
                value.as_i64().unwrap() < 3
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(visited.len(), 4);
        assert_eq!(visited[3], (EntryKey::Index(3), 3));

        let mut dict = IpcValue::dictionary();
        dict.insert("b", 2i64).unwrap();
        dict.insert("a", 1i64).unwrap();
        let mut keys = Vec::new();
        assert!(dict
            .apply(|key, _| {
                if let EntryKey::Key(k) = key {
                    keys.push(k.to_string());
                }
                true
            })
            .unwrap());
        assert_eq!(keys, vec!["a", "b"]);

        assert!(IpcValue::Null.apply(|_, _| true).is_err());
    }

    #[test]
    fn test_fd_equality_is_descriptor_identity() {
        let file = tempfile::tempfile().unwrap();
        let original = IpcFd::new(OwnedFd::from(file));
        let duplicate = IpcFd::new(original.try_clone_owned().unwrap());
        assert_ne!(original.as_fd().as_raw_fd(), duplicate.as_fd().as_raw_fd());
        assert_eq!(original, duplicate);

        let other = IpcFd::new(OwnedFd::from(tempfile::tempfile().unwrap()));
        assert_ne!(original, other);
    }

    #[test]
    fn test_duplicate_preserves_values() {
        let mut dict = IpcValue::dictionary();
        dict.insert("data", IpcValue::data(vec![0u8, 1, 255])).unwrap();
        dict.insert("error", RichError::transient("busy")).unwrap();
        dict.insert("fd", IpcValue::fd(OwnedFd::from(tempfile::tempfile().unwrap())))
            .unwrap();
        assert_eq!(dict.duplicate().unwrap(), dict);
    }

    #[test]
    fn test_create_reply_requires_dictionary() {
        assert_eq!(
            IpcValue::dictionary().create_reply().unwrap(),
            IpcValue::dictionary()
        );
        assert!(IpcValue::array().create_reply().is_err());
    }
}

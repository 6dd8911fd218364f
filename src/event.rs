//! Typed security events and field accessors
//!
//! Events arrive already decoded from the collection layer. Rules reference
//! fields by their dotted name (`open.file.path`, `process.pid`, ...); each
//! name is resolved once, when a rule is compiled, into a [`FieldAccessor`]
//! holding a plain function pointer, so evaluation never looks fields up by
//! string.

use serde::{Deserialize, Serialize};

/// A field or variable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Membership for lists, substring for strings, equality otherwise
    pub fn contains(&self, needle: &Value) -> bool {
        match (self, needle) {
            (Value::List(items), _) => items.contains(needle),
            (Value::Str(hay), Value::Str(n)) => hay.contains(n.as_str()),
            _ => self == needle,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Exec,
    Exit,
    Open,
    Unlink,
    Chmod,
    Kill,
    Sysctl,
    Mount,
    Dns,
    Connect,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Exec => "exec",
            EventType::Exit => "exit",
            EventType::Open => "open",
            EventType::Unlink => "unlink",
            EventType::Chmod => "chmod",
            EventType::Kill => "kill",
            EventType::Sysctl => "sysctl",
            EventType::Mount => "mount",
            EventType::Dns => "dns",
            EventType::Connect => "connect",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process the event was raised for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessContext {
    pub pid: u32,
    #[serde(default)]
    pub ppid: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub comm: String,
    /// Path of the executable
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub cgroup_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub flags: Option<u32>,
}

impl FileInfo {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillInfo {
    pub target_pid: u32,
    pub signal: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysctlInfo {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    pub source: String,
    pub mountpoint: String,
    #[serde(default)]
    pub fs_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsInfo {
    pub question: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub ip: String,
    pub port: u16,
}

/// A decoded kernel event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Kernel timestamp in nanoseconds
    #[serde(default)]
    pub timestamp: u64,
    pub process: ProcessContext,
    /// Target file for exec/open/unlink/chmod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill: Option<KillInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysctl: Option<SysctlInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectInfo>,
}

impl Event {
    pub fn new(event_type: EventType, process: ProcessContext) -> Self {
        Self {
            event_type,
            timestamp: 0,
            process,
            file: None,
            kill: None,
            sysctl: None,
            mount: None,
            dns: None,
            connect: None,
        }
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file = Some(FileInfo {
            path: path.into(),
            ..FileInfo::default()
        });
        self
    }

    pub fn container_id(&self) -> Option<&str> {
        self.process.container_id.as_deref()
    }

    pub fn cgroup_id(&self) -> Option<&str> {
        self.process.cgroup_id.as_deref()
    }
}

type Getter = fn(&Event) -> Option<Value>;

/// A field name resolved to its getter
#[derive(Clone, Copy)]
pub struct FieldAccessor {
    name: &'static str,
    /// Event type the field belongs to, `None` for fields common to every event
    event_type: Option<EventType>,
    get: Getter,
}

impl FieldAccessor {
    /// Resolve a dotted field name. Returns `None` for unknown fields.
    pub fn resolve(name: &str) -> Option<Self> {
        FIELDS.iter().find(|f| f.name == name).copied()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn event_type(&self) -> Option<EventType> {
        self.event_type
    }

    /// Read the field, `None` when the event does not carry it
    pub fn get(&self, event: &Event) -> Option<Value> {
        match self.event_type {
            Some(t) if t != event.event_type => None,
            _ => (self.get)(event),
        }
    }
}

impl std::fmt::Debug for FieldAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl PartialEq for FieldAccessor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

fn file_path(ev: &Event) -> Option<Value> {
    ev.file.as_ref().map(|f| Value::from(f.path.as_str()))
}

fn file_name(ev: &Event) -> Option<Value> {
    ev.file.as_ref().map(|f| Value::from(f.name()))
}

const fn field(name: &'static str, event_type: Option<EventType>, get: Getter) -> FieldAccessor {
    FieldAccessor { name, event_type, get }
}

static FIELDS: &[FieldAccessor] = &[
    // Common to every event
    field("event.type", None, |ev| Some(ev.event_type.as_str().into())),
    field("process.pid", None, |ev| Some(Value::Int(ev.process.pid as i64))),
    field("process.ppid", None, |ev| Some(Value::Int(ev.process.ppid as i64))),
    field("process.uid", None, |ev| Some(Value::Int(ev.process.uid as i64))),
    field("process.comm", None, |ev| Some(ev.process.comm.as_str().into())),
    field("process.file.path", None, |ev| Some(ev.process.executable.as_str().into())),
    field("process.file.name", None, |ev| {
        let exe = &ev.process.executable;
        Some(exe.rsplit('/').next().unwrap_or(exe).into())
    }),
    field("process.args", None, |ev| {
        Some(Value::List(ev.process.args.iter().map(|a| a.as_str().into()).collect()))
    }),
    field("container.id", None, |ev| ev.container_id().map(Value::from)),
    field("cgroup.id", None, |ev| ev.cgroup_id().map(Value::from)),
    // exec
    field("exec.file.path", Some(EventType::Exec), file_path),
    field("exec.file.name", Some(EventType::Exec), file_name),
    // open
    field("open.file.path", Some(EventType::Open), file_path),
    field("open.file.name", Some(EventType::Open), file_name),
    field("open.flags", Some(EventType::Open), |ev| {
        ev.file.as_ref().and_then(|f| f.flags).map(|m| Value::Int(m as i64))
    }),
    // unlink / chmod
    field("unlink.file.path", Some(EventType::Unlink), file_path),
    field("unlink.file.name", Some(EventType::Unlink), file_name),
    field("chmod.file.path", Some(EventType::Chmod), file_path),
    field("chmod.file.mode", Some(EventType::Chmod), |ev| {
        ev.file.as_ref().and_then(|f| f.mode).map(|m| Value::Int(m as i64))
    }),
    // kill
    field("kill.signal", Some(EventType::Kill), |ev| {
        ev.kill.as_ref().map(|k| Value::Int(k.signal as i64))
    }),
    field("kill.target.pid", Some(EventType::Kill), |ev| {
        ev.kill.as_ref().map(|k| Value::Int(k.target_pid as i64))
    }),
    // sysctl
    field("sysctl.name", Some(EventType::Sysctl), |ev| {
        ev.sysctl.as_ref().map(|s| s.name.as_str().into())
    }),
    field("sysctl.value", Some(EventType::Sysctl), |ev| {
        ev.sysctl.as_ref().map(|s| s.value.as_str().into())
    }),
    // mount
    field("mount.source.path", Some(EventType::Mount), |ev| {
        ev.mount.as_ref().map(|m| m.source.as_str().into())
    }),
    field("mount.mountpoint.path", Some(EventType::Mount), |ev| {
        ev.mount.as_ref().map(|m| m.mountpoint.as_str().into())
    }),
    field("mount.fs_type", Some(EventType::Mount), |ev| {
        ev.mount.as_ref().map(|m| m.fs_type.as_str().into())
    }),
    // dns
    field("dns.question.name", Some(EventType::Dns), |ev| {
        ev.dns.as_ref().map(|d| d.question.as_str().into())
    }),
    // connect
    field("connect.addr.ip", Some(EventType::Connect), |ev| {
        ev.connect.as_ref().map(|c| c.ip.as_str().into())
    }),
    field("connect.addr.port", Some(EventType::Connect), |ev| {
        ev.connect.as_ref().map(|c| Value::Int(c.port as i64))
    }),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn open_event(path: &str) -> Event {
        Event::new(
            EventType::Open,
            ProcessContext {
                pid: 42,
                executable: "/usr/bin/cat".to_string(),
                container_id: Some("abc123".to_string()),
                ..ProcessContext::default()
            },
        )
        .with_file(path)
    }

    #[test]
    fn test_resolve_and_get() {
        let ev = open_event("/etc/shadow");

        let path = FieldAccessor::resolve("open.file.path").unwrap();
        assert_eq!(path.event_type(), Some(EventType::Open));
        assert_eq!(path.get(&ev), Some(Value::from("/etc/shadow")));

        let name = FieldAccessor::resolve("open.file.name").unwrap();
        assert_eq!(name.get(&ev), Some(Value::from("shadow")));

        let exe = FieldAccessor::resolve("process.file.name").unwrap();
        assert_eq!(exe.get(&ev), Some(Value::from("cat")));

        let cid = FieldAccessor::resolve("container.id").unwrap();
        assert_eq!(cid.get(&ev), Some(Value::from("abc123")));
    }

    #[test]
    fn test_field_of_other_event_type_is_absent() {
        let ev = open_event("/etc/shadow");
        let unlink = FieldAccessor::resolve("unlink.file.path").unwrap();
        assert_eq!(unlink.get(&ev), None);
    }

    #[test]
    fn test_unknown_field() {
        assert!(FieldAccessor::resolve("open.file.colour").is_none());
    }

    #[test]
    fn test_value_contains() {
        let list = Value::List(vec![Value::from("a"), Value::Int(3)]);
        assert!(list.contains(&Value::Int(3)));
        assert!(!list.contains(&Value::from("b")));
        assert!(Value::from("/tmp/payload.sh").contains(&Value::from("payload")));
    }

    #[test]
    fn test_event_json_shape() {
        let json = r#"{
            "type": "open",
            "process": {"pid": 7, "executable": "/bin/sh"},
            "file": {"path": "/etc/passwd"}
        }"#;
        let ev: Event = serde_json::from_str(json).unwrap();
        assert_eq!(ev.event_type, EventType::Open);
        assert_eq!(ev.process.pid, 7);
        assert_eq!(ev.file.unwrap().name(), "passwd");
    }
}

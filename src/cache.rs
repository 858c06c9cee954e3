//! Cache of resolved tracepoint registrations.
//!
//! Bridges parsed [`TracepointSpec`]s to live kernel tracepoint identity:
//! loads format metadata from tracefs for existing tracepoints and
//! pre-registers user_events definitions through the `user_events_data`
//! ioctl channel. At most one [`Registration`] exists per
//! `(system, event)` key for the lifetime of the cache.
//!
//! The cache is intentionally not shared across threads; the collector runs
//! sessions sequentially on one thread (the type is neither `Sync` nor
//! handed out behind an `Arc`).

use crate::format::EventFormat;
use crate::format::FormatError;
use crate::spec::TracepointSpec;
use compact_str::CompactString;
use compact_str::format_compact;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

/// Field suffix the kernel expects for an EventHeader-encoded tracepoint
/// (the self-describing payload convention; fields are fixed by it).
const EVENTHEADER_COMMAND_TYPES: &str =
    "u8 eventheader_flags; u8 version; u16 id; u16 tag; u8 opcode; u8 level";

/// Errors from resolving or registering one tracepoint.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The kernel has no tracepoint with this system and event name.
    #[error("tracepoint {system}:{event} not found")]
    NotFound {
        system: CompactString,
        event: CompactString,
    },
    /// The tracepoint exists but its format file could not be parsed.
    #[error("bad format for {system}:{event}: {source}")]
    BadFormat {
        system: CompactString,
        event: CompactString,
        source: FormatError,
    },
    /// The spec is not a definition (nothing to pre-register).
    #[error("spec is not a definition")]
    NotADefinition,
    /// The user_events registration channel could not be opened or the
    /// registration ioctl failed.
    #[error("user_events registration failed: {0}")]
    Registration(#[source] io::Error),
    /// Other IO failure while reading tracefs.
    #[error("tracefs read failed: {0}")]
    Io(#[from] io::Error),
}

/// Whether a resolution hit the cache or touched the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Format was freshly loaded (and possibly registered) now.
    Loaded,
    /// An identical registration was already cached.
    Cached,
}

/// One resolved tracepoint: identity plus parsed kernel format.
#[derive(Debug, Clone)]
pub struct Registration {
    pub system: CompactString,
    pub event: CompactString,
    pub format: EventFormat,
}

impl Registration {
    /// Kernel-assigned event id used in ring-buffer records.
    pub fn format_id(&self) -> u32 {
        self.format.id
    }

    /// `system:event` display name.
    pub fn full_name(&self) -> CompactString {
        format_compact!("{}:{}", self.system, self.event)
    }
}

/// Registration channel for user-defined tracepoints. Production
/// implementation is [`UserEventsFile`]; tests substitute a recorder.
pub trait UserEventsRegistrar {
    /// Register one tracepoint from its command string
    /// (`name[:flags] fields`). "Already registered" is success.
    fn register(&mut self, command: &str) -> io::Result<()>;
}

/// `user_reg` ioctl argument, see `include/uapi/linux/user_events.h`.
#[repr(C, packed)]
struct UserReg {
    size: u32,
    enable_bit: u8,
    enable_size: u8,
    flags: u16,
    enable_addr: u64,
    name_args: u64,
    write_index: u32,
}

/// `_IOWR('*', 0, struct user_reg)`
const DIAG_IOCSREG: libc::c_ulong = 0xC01C_2A00;

/// Owned handle to `<tracefs>/user_events_data`.
///
/// Each registration passes the kernel an enable-word address that must stay
/// valid while the registration lives, so the words are boxed and retained
/// here for the lifetime of the handle.
pub struct UserEventsFile {
    file: File,
    enable_words: Vec<Box<u32>>,
}

impl UserEventsFile {
    pub fn open(tracefs: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(tracefs.join("user_events_data"))?;
        Ok(Self {
            file,
            enable_words: Vec::new(),
        })
    }
}

impl UserEventsRegistrar for UserEventsFile {
    fn register(&mut self, command: &str) -> io::Result<()> {
        let mut name_args = command.as_bytes().to_vec();
        name_args.push(0);

        let enable_word = Box::new(0u32);
        let mut reg = UserReg {
            size: size_of::<UserReg>() as u32,
            enable_bit: 0,
            enable_size: size_of::<u32>() as u8,
            flags: 0,
            enable_addr: &*enable_word as *const u32 as u64,
            name_args: name_args.as_ptr() as u64,
            write_index: 0,
        };

        // SAFETY: fd is a valid open user_events_data handle; `reg` points
        // at properly initialized memory matching the kernel's struct, and
        // both the command string and the enable word outlive the call.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), DIAG_IOCSREG as _, &mut reg) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // A concurrent registration of the same name is success.
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }
        }
        self.enable_words.push(enable_word);
        Ok(())
    }
}

/// Deduplicating resolver from `(system, event)` to [`Registration`].
pub struct TracepointCache {
    tracefs: PathBuf,
    registrar: Option<Box<dyn UserEventsRegistrar>>,
    entries: HashMap<(CompactString, CompactString), Registration>,
}

impl TracepointCache {
    /// Cache over the given tracefs root (usually `/sys/kernel/tracing`).
    /// The registration channel is opened on first use.
    pub fn new(tracefs: impl Into<PathBuf>) -> Self {
        Self {
            tracefs: tracefs.into(),
            registrar: None,
            entries: HashMap::new(),
        }
    }

    /// Cache with an explicit registration channel (used by tests).
    pub fn with_registrar(
        tracefs: impl Into<PathBuf>,
        registrar: Box<dyn UserEventsRegistrar>,
    ) -> Self {
        Self {
            tracefs: tracefs.into(),
            registrar: Some(registrar),
            entries: HashMap::new(),
        }
    }

    /// Look up an already-registered tracepoint by name. Idempotent:
    /// repeated calls return the cached entry without touching tracefs.
    pub fn add_from_system(
        &mut self,
        system: &str,
        event: &str,
    ) -> Result<(CacheOutcome, &Registration), CacheError> {
        let key = (CompactString::from(system), CompactString::from(event));
        let format_path = format_file_path(&self.tracefs, system, event);
        match self.entries.entry(key) {
            Entry::Occupied(e) => Ok((CacheOutcome::Cached, e.into_mut())),
            Entry::Vacant(e) => {
                let format = load_format(&format_path, system, event)?;
                let reg = e.insert(Registration {
                    system: system.into(),
                    event: event.into(),
                    format,
                });
                Ok((CacheOutcome::Loaded, reg))
            }
        }
    }

    /// Pre-register a `Definition` or `EventHeaderDefinition` spec in the
    /// kernel (if not already present), then load its format. Racing with
    /// other processes registering the same name is fine: "already exists"
    /// is success.
    pub fn preregister(
        &mut self,
        spec: &TracepointSpec,
    ) -> Result<(CacheOutcome, &Registration), CacheError> {
        let (system, event, command) = match spec {
            TracepointSpec::Definition {
                system,
                event,
                flags,
                fields,
            } => {
                let name = match flags {
                    Some(flags) => format_compact!("{event}:{flags}"),
                    None => event.clone(),
                };
                let fields = fields.trim();
                let command = if fields == ";" || fields.is_empty() {
                    name.to_string()
                } else {
                    format!("{name} {fields}")
                };
                (system, event, command)
            }
            TracepointSpec::EventHeaderDefinition {
                system,
                event,
                flags,
            } => {
                let name = match flags {
                    Some(flags) => format_compact!("{event}:{flags}"),
                    None => event.clone(),
                };
                (system, event, format!("{name} {EVENTHEADER_COMMAND_TYPES}"))
            }
            _ => return Err(CacheError::NotADefinition),
        };

        let key = (system.clone(), event.clone());
        if self.entries.contains_key(&key) {
            // Already resolved; no kernel registration call.
            return self.add_from_system(system, event);
        }

        self.registrar()?
            .register(&command)
            .map_err(CacheError::Registration)?;
        self.add_from_system(system, event)
    }

    /// Resolve any usable spec: identifiers through [`Self::add_from_system`],
    /// definitions through [`Self::preregister`].
    pub fn resolve(
        &mut self,
        spec: &TracepointSpec,
    ) -> Result<(CacheOutcome, &Registration), CacheError> {
        match spec {
            TracepointSpec::Identifier { system, event } => self.add_from_system(system, event),
            TracepointSpec::Definition { .. } | TracepointSpec::EventHeaderDefinition { .. } => {
                self.preregister(spec)
            }
            TracepointSpec::Empty | TracepointSpec::Error(_) => Err(CacheError::NotADefinition),
        }
    }

    fn registrar(&mut self) -> Result<&mut dyn UserEventsRegistrar, CacheError> {
        if self.registrar.is_none() {
            let file = UserEventsFile::open(&self.tracefs).map_err(CacheError::Registration)?;
            self.registrar = Some(Box::new(file));
        }
        match &mut self.registrar {
            Some(registrar) => Ok(registrar.as_mut()),
            None => unreachable!("registrar was just installed"),
        }
    }
}

fn format_file_path(tracefs: &Path, system: &str, event: &str) -> PathBuf {
    let mut path = tracefs.join("events");
    path.push(system);
    path.push(event);
    path.push("format");
    path
}

fn load_format(path: &Path, system: &str, event: &str) -> Result<EventFormat, CacheError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(CacheError::NotFound {
                system: system.into(),
                event: event.into(),
            });
        }
        Err(err) => return Err(err.into()),
    };
    EventFormat::parse(&text).map_err(|source| CacheError::BadFormat {
        system: system.into(),
        event: event.into(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Recording registrar: counts kernel registration calls and creates the
    /// format file a real registration would make visible in tracefs.
    struct FakeRegistrar {
        tracefs: PathBuf,
        calls: Rc<Cell<usize>>,
        next_id: u32,
    }

    impl UserEventsRegistrar for FakeRegistrar {
        fn register(&mut self, command: &str) -> io::Result<()> {
            self.calls.set(self.calls.get() + 1);
            let name = command.split([' ', ':']).next().unwrap();
            write_format(&self.tracefs, "user_events", name, self.next_id);
            self.next_id += 1;
            Ok(())
        }
    }

    fn write_format(tracefs: &Path, system: &str, event: &str, id: u32) {
        let dir = tracefs.join("events").join(system).join(event);
        std::fs::create_dir_all(&dir).unwrap();
        let text = format!(
            "name: {event}\nID: {id}\nformat:\n\
             \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
             \n\
             \tfield:u32 count;\toffset:8;\tsize:4;\tsigned:0;\n"
        );
        std::fs::write(dir.join("format"), text).unwrap();
    }

    #[test]
    fn add_from_system_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_format(dir.path(), "sched", "sched_switch", 308);

        let mut cache = TracepointCache::new(dir.path());
        let (outcome, reg) = cache.add_from_system("sched", "sched_switch").unwrap();
        assert_eq!(outcome, CacheOutcome::Loaded);
        assert_eq!(reg.format_id(), 308);

        let (outcome, reg) = cache.add_from_system("sched", "sched_switch").unwrap();
        assert_eq!(outcome, CacheOutcome::Cached);
        assert_eq!(reg.format_id(), 308);
    }

    #[test]
    fn missing_tracepoint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = TracepointCache::new(dir.path());
        assert!(matches!(
            cache.add_from_system("nosys", "noevent"),
            Err(CacheError::NotFound { .. })
        ));
    }

    #[test]
    fn preregister_registers_once_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Rc::new(Cell::new(0));
        let registrar = FakeRegistrar {
            tracefs: dir.path().to_path_buf(),
            calls: calls.clone(),
            next_id: 100,
        };
        let mut cache = TracepointCache::with_registrar(dir.path(), Box::new(registrar));

        let spec = TracepointSpec::parse("MyEvent u32 count");
        let (outcome, reg) = cache.preregister(&spec).unwrap();
        assert_eq!(outcome, CacheOutcome::Loaded);
        assert_eq!(reg.format_id(), 100);
        assert_eq!(calls.get(), 1);

        // Same key again: cached, no new kernel call.
        let (outcome, reg) = cache.preregister(&spec).unwrap();
        assert_eq!(outcome, CacheOutcome::Cached);
        assert_eq!(reg.format_id(), 100);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn cached_entry_survives_mixed_resolution_paths() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Rc::new(Cell::new(0));
        let registrar = FakeRegistrar {
            tracefs: dir.path().to_path_buf(),
            calls: calls.clone(),
            next_id: 55,
        };
        let mut cache = TracepointCache::with_registrar(dir.path(), Box::new(registrar));

        write_format(dir.path(), "user_events", "Shared", 55);
        let (o1, r1) = cache.add_from_system("user_events", "Shared").unwrap();
        assert_eq!(o1, CacheOutcome::Loaded);
        let id1 = r1.format_id();
        let (o2, _) = cache.add_from_system("user_events", "Shared").unwrap();
        assert_eq!(o2, CacheOutcome::Cached);

        // Preregistering the same key returns the identical cached
        // registration without issuing a kernel registration call.
        let spec = TracepointSpec::parse("Shared u32 count");
        let (o3, r3) = cache.preregister(&spec).unwrap();
        assert_eq!(o3, CacheOutcome::Cached);
        assert_eq!(r3.format_id(), id1);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn eventheader_command_shape() {
        let dir = tempfile::tempdir().unwrap();
        struct Capture {
            tracefs: PathBuf,
            command: Rc<Cell<Option<String>>>,
        }
        impl UserEventsRegistrar for Capture {
            fn register(&mut self, command: &str) -> io::Result<()> {
                self.command.set(Some(command.to_string()));
                let name = command.split([' ', ':']).next().unwrap();
                write_format(&self.tracefs, "user_events", name, 9);
                Ok(())
            }
        }
        let command = Rc::new(Cell::new(None));
        let mut cache = TracepointCache::with_registrar(
            dir.path(),
            Box::new(Capture {
                tracefs: dir.path().to_path_buf(),
                command: command.clone(),
            }),
        );

        let spec = TracepointSpec::parse("MyProvider_L5K1f");
        cache.preregister(&spec).unwrap();
        let sent = command.take().unwrap();
        assert!(sent.starts_with("MyProvider_L5K1f u8 eventheader_flags;"));
    }
}

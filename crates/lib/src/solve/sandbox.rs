//! Namespace sandbox for exec nodes.
//!
//! The command runs in fresh user and mount namespaces, chrooted into the
//! staged root filesystem, with the calling user mapped to root. Every mount
//! of the exec is bind-mounted at its target; read-only mounts are remounted
//! read-only. Absolute paths therefore resolve inside the root filesystem and
//! never reach the host.
//!
//! Host directories the root filesystem does not provide (`/bin`, `/usr`,
//! `/lib`, ...) are bound read-only, so a scratch root can still run a shell.
//! `/dev` is a private tmpfs holding the basic character devices.
//!
//! Only Linux is supported. Elsewhere [`supported`] is false and
//! [`Sandbox::prepare`] fails.

use std::path::{Path, PathBuf};

/// Host directories bound read-only when the root filesystem lacks them.
const HOST_TOOL_DIRS: &[&str] = &["/bin", "/sbin", "/usr", "/lib", "/lib32", "/lib64", "/libx32"];

/// Character devices exposed under `/dev`.
const DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom"];

#[derive(Debug, Clone)]
struct Bind {
  source: PathBuf,
  /// Absolute path inside the sandbox.
  target: String,
  readonly: bool,
}

/// What an exec should see, before any host state is inspected.
#[derive(Debug)]
pub struct Sandbox {
  rootfs: PathBuf,
  cwd: String,
  readonly_root: bool,
  binds: Vec<Bind>,
}

impl Sandbox {
  pub fn new(rootfs: &Path, cwd: &str) -> Self {
    Self {
      rootfs: rootfs.to_path_buf(),
      cwd: cwd.to_string(),
      readonly_root: false,
      binds: Vec::new(),
    }
  }

  pub fn readonly_root(mut self, readonly: bool) -> Self {
    self.readonly_root = readonly;
    self
  }

  /// Bind `source` at `target`. Binds are applied in the order added, so
  /// parents must come before the mounts nested inside them.
  pub fn bind(&mut self, source: PathBuf, target: &str, readonly: bool) {
    self.binds.push(Bind {
      source,
      target: target.to_string(),
      readonly,
    });
  }

  /// True when a bind covers `dir` or something below it.
  fn binds_within(&self, dir: &str) -> bool {
    self.binds.iter().any(|b| {
      let target = b.target.trim_end_matches('/');
      target == dir || target.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
    })
  }
}

/// Map an absolute in-sandbox path onto the host root filesystem directory.
pub fn resolve_in(rootfs: &Path, path: &str) -> PathBuf {
  let rel = path.trim_start_matches('/');
  if rel.is_empty() {
    rootfs.to_path_buf()
  } else {
    rootfs.join(rel)
  }
}

#[cfg(target_os = "linux")]
pub use linux::{Prepared, supported};

#[cfg(not(target_os = "linux"))]
pub use fallback::{Prepared, supported};

#[cfg(target_os = "linux")]
mod linux {
  use std::fs;
  use std::io;
  use std::path::{Path, PathBuf};
  use std::sync::{Arc, OnceLock};

  use nix::mount::{MsFlags, mount};
  use nix::sched::{CloneFlags, unshare};
  use nix::sys::statvfs::{FsFlags, statvfs};
  use nix::sys::wait::{WaitStatus, waitpid};
  use nix::unistd::{ForkResult, chdir, chroot, fork, getgid, getuid};
  use tokio::process::Command;
  use tracing::debug;

  use super::{DEVICES, HOST_TOOL_DIRS, Sandbox, resolve_in};

  /// Whether this host lets an unprivileged process create user and mount
  /// namespaces. Checked once per process.
  pub fn supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| match check_namespaces() {
      Ok(()) => true,
      Err(e) => {
        debug!(error = %e, "namespace sandbox unavailable");
        false
      }
    })
  }

  fn check_namespaces() -> io::Result<()> {
    // SAFETY: the child makes only raw syscalls before `_exit`.
    match unsafe { fork() }? {
      ForkResult::Child => {
        let ok = unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS).is_ok()
          && mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
          )
          .is_ok();
        // SAFETY: `_exit` skips atexit handlers, which must not run in a forked child.
        unsafe { nix::libc::_exit(if ok { 0 } else { 1 }) }
      }
      ForkResult::Parent { child } => match waitpid(child, None)? {
        WaitStatus::Exited(_, 0) => Ok(()),
        status => Err(io::Error::other(format!("namespace check child ended with {:?}", status))),
      },
    }
  }

  #[derive(Debug)]
  struct PlannedBind {
    source: PathBuf,
    target: PathBuf,
    /// Flags the read-only remount must keep; `None` for read-write binds.
    readonly: Option<MsFlags>,
  }

  /// Everything the child does between fork and exec, fully resolved up
  /// front so the child never allocates.
  #[derive(Debug)]
  struct Plan {
    rootfs: PathBuf,
    readonly_root: Option<MsFlags>,
    binds: Vec<PlannedBind>,
    dev: Option<PathBuf>,
    devices: Vec<(PathBuf, PathBuf)>,
    cwd: PathBuf,
    uid_map: String,
    gid_map: String,
  }

  /// A sandbox ready to be installed on a command.
  #[derive(Debug)]
  pub struct Prepared {
    plan: Arc<Plan>,
    /// Mountpoints created only for host directories, removed afterwards.
    created: Vec<PathBuf>,
  }

  impl Sandbox {
    pub fn prepare(self) -> io::Result<Prepared> {
      let mut created = Vec::new();
      let mut binds = Vec::new();

      for dir in HOST_TOOL_DIRS {
        let host = PathBuf::from(dir);
        let inside = resolve_in(&self.rootfs, dir);
        if !host.is_dir() || fs::symlink_metadata(&inside).is_ok() || self.binds_within(dir) {
          continue;
        }
        fs::create_dir(&inside)?;
        created.push(inside.clone());
        binds.push(PlannedBind {
          readonly: Some(locked_flags(&host)?),
          source: host,
          target: inside,
        });
      }

      for bind in &self.binds {
        binds.push(PlannedBind {
          readonly: if bind.readonly {
            Some(locked_flags(&bind.source)?)
          } else {
            None
          },
          source: bind.source.clone(),
          target: resolve_in(&self.rootfs, &bind.target),
        });
      }

      let dev_dir = self.rootfs.join("dev");
      let dev = match fs::symlink_metadata(&dev_dir) {
        Ok(meta) if meta.is_dir() => Some(dev_dir),
        Ok(_) => None,
        Err(_) => {
          fs::create_dir(&dev_dir)?;
          created.push(dev_dir.clone());
          Some(dev_dir)
        }
      };
      let devices = match &dev {
        Some(dev) => DEVICES
          .iter()
          .map(|name| (PathBuf::from("/dev").join(name), dev.join(name)))
          .filter(|(host, _)| host.exists())
          .collect(),
        None => Vec::new(),
      };

      let readonly_root = if self.readonly_root {
        Some(locked_flags(&self.rootfs)?)
      } else {
        None
      };

      let plan = Plan {
        readonly_root,
        binds,
        dev,
        devices,
        cwd: PathBuf::from(&self.cwd),
        uid_map: format!("0 {} 1\n", getuid()),
        gid_map: format!("0 {} 1\n", getgid()),
        rootfs: self.rootfs,
      };
      debug!(rootfs = ?plan.rootfs, binds = plan.binds.len(), "prepared sandbox");

      Ok(Prepared {
        plan: Arc::new(plan),
        created,
      })
    }
  }

  impl Prepared {
    /// Make `command` enter the sandbox before it execs.
    pub fn install(&self, command: &mut Command) {
      let plan = Arc::clone(&self.plan);
      // SAFETY: `enter` only issues syscalls on paths resolved before the
      // fork; it takes no locks and does not allocate.
      unsafe {
        command.pre_exec(move || plan.enter());
      }
    }

    /// Remove mountpoints that were created for host directories.
    pub fn cleanup(self) -> io::Result<()> {
      for path in self.created.iter().rev() {
        match fs::remove_dir(path) {
          Ok(()) => {}
          Err(e) if e.kind() == io::ErrorKind::NotFound => {}
          Err(e) => return Err(e),
        }
      }
      Ok(())
    }
  }

  impl Plan {
    fn enter(&self) -> io::Result<()> {
      unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)?;
      match fs::write("/proc/self/setgroups", b"deny") {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
      }
      fs::write("/proc/self/uid_map", self.uid_map.as_bytes())?;
      fs::write("/proc/self/gid_map", self.gid_map.as_bytes())?;

      // Nothing below may propagate back to the host.
      mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
      )?;

      if self.readonly_root.is_some() {
        bind(&self.rootfs, &self.rootfs)?;
      }

      for planned in &self.binds {
        if fs::symlink_metadata(&planned.target).is_err() {
          fs::create_dir_all(&planned.target)?;
        }
        bind(&planned.source, &planned.target)?;
        if let Some(locked) = planned.readonly {
          remount_readonly(&planned.target, locked)?;
        }
      }

      if let Some(dev) = &self.dev {
        mount(
          Some("tmpfs"),
          dev.as_path(),
          Some("tmpfs"),
          MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
          Some("mode=0755"),
        )?;
        for (host, inside) in &self.devices {
          fs::File::create(inside)?;
          bind(host, inside)?;
        }
      }

      if let Some(locked) = self.readonly_root {
        remount_readonly(&self.rootfs, locked)?;
      }

      chroot(self.rootfs.as_path())?;
      if fs::metadata(&self.cwd).is_err() {
        fs::create_dir_all(&self.cwd)?;
      }
      chdir(self.cwd.as_path())?;
      Ok(())
    }
  }

  fn bind(source: &Path, target: &Path) -> io::Result<()> {
    mount(
      Some(source),
      target,
      None::<&str>,
      MsFlags::MS_BIND | MsFlags::MS_REC,
      None::<&str>,
    )?;
    Ok(())
  }

  fn remount_readonly(target: &Path, locked: MsFlags) -> io::Result<()> {
    mount(
      None::<&str>,
      target,
      None::<&str>,
      MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | locked,
      None::<&str>,
    )?;
    Ok(())
  }

  /// Flags of the mount holding `path` that an unprivileged remount may not
  /// drop.
  fn locked_flags(path: &Path) -> io::Result<MsFlags> {
    let flags = statvfs(path)?.flags();
    let mut locked = MsFlags::empty();
    for (fs_flag, ms_flag) in [
      (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
      (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
      (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
      (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
      (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
      (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
      if flags.contains(fs_flag) {
        locked |= ms_flag;
      }
    }
    Ok(locked)
  }
}

#[cfg(not(target_os = "linux"))]
mod fallback {
  use std::io;

  use tokio::process::Command;

  use super::Sandbox;

  pub fn supported() -> bool {
    false
  }

  #[derive(Debug)]
  pub struct Prepared;

  impl Sandbox {
    pub fn prepare(self) -> io::Result<Prepared> {
      Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "the exec sandbox requires Linux namespaces",
      ))
    }
  }

  impl Prepared {
    pub fn install(&self, _command: &mut Command) {}

    pub fn cleanup(self) -> io::Result<()> {
      Ok(())
    }
  }
}

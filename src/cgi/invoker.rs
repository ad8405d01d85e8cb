//! Running one handler process per request
//!
//! The child gets its own process group so that a timeout takes down
//! anything it forked as well. Its stdout and stderr are read on two threads
//! into bounded buffers while a third feeds the request body to its stdin.
//! One deadline covers both the child and its output: a process that left
//! the group can keep a pipe open, but not the request.

use crate::cgi::env::CgiEnvironment;
use crate::config::CgiConfig;
use crate::errors::{Result, Error};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use wait_timeout::ChildExt;

use std::collections::HashMap;
use std::env;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 8 * 1024;

/// A finished handler run
#[derive(Debug)]
pub struct HandlerInvocation {
    pub stdout: Vec<u8>,
    /// Diagnostics only; never sent to the client
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
    pub elapsed: Duration
}

/// Something that can run a handler to completion
pub trait ProcessInvoker: Send + Sync {
    /// Runs the handler named by `SCRIPT_FILENAME` in `env`, feeding it `body`.
    ///
    /// A non-zero exit is still `Ok`; the status is in the result.
    fn invoke(&self, env: &CgiEnvironment, body: &[u8], timeout: Duration)
              -> Result<HandlerInvocation>;
}

/// Runs handlers as local child processes
pub struct LocalInvoker {
    interpreters: HashMap<String, PathBuf>,
    max_stdout_bytes: usize,
    max_stderr_bytes: usize,
    slots: Slots
}

impl LocalInvoker {
    pub fn new(config: &CgiConfig) -> LocalInvoker {
        LocalInvoker {
            interpreters: config.interpreters.clone(),
            max_stdout_bytes: config.max_stdout_bytes,
            max_stderr_bytes: config.max_stderr_bytes,
            slots: Slots::new(config.max_concurrent)
        }
    }

    /// Handlers running right now
    pub fn in_flight(&self) -> usize {
        self.slots.in_flight()
    }

    fn command_for(&self, script: &Path) -> Command {
        let interpreter = script.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.interpreters.get(ext));

        let mut command = match interpreter {
            Some(program) => {
                let mut command = Command::new(program);
                command.arg(script);
                command
            },
            None => Command::new(script)
        };

        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        command
    }
}

impl ProcessInvoker for LocalInvoker {
    fn invoke(&self, cgi_env: &CgiEnvironment, body: &[u8], timeout: Duration)
              -> Result<HandlerInvocation>
    {
        let script = cgi_env.script_filename().ok_or_else(|| {
            Error::Configuration(String::from("SCRIPT_FILENAME is not set"))
        })?;

        let mut command = self.command_for(script);
        command.env_clear().envs(cgi_env);
        if !cgi_env.contains("PATH") {
            if let Some(path) = env::var_os("PATH") {
                command.env("PATH", path);
            }
        }
        command.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let _slot = self.slots.acquire();
        let started = Instant::now();

        let mut child = command.spawn().map_err(Error::Launch)?;
        debug!("Started handler {} as pid {}", script.display(), child.id());

        let deadline = started + timeout;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut reaper = Reaper::new(child);
        let (max_stdout, max_stderr) = (self.max_stdout_bytes, self.max_stderr_bytes);

        let body = body.to_vec();
        thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // A handler may exit without reading its input
                let _ = stdin.write_all(&body);
            }
        });

        let (tx, rx) = mpsc::channel();
        spawn_reader(Stream::Stdout, stdout, max_stdout, tx.clone());
        spawn_reader(Stream::Stderr, stderr, max_stderr, tx);

        let status = match reaper.wait_timeout(timeout) {
            Ok(Some(status)) => {
                // Stragglers would hold our pipes open
                reaper.kill_group();
                status
            },
            Ok(None) => {
                reaper.terminate();
                warn!("Handler {} killed after {:?}", script.display(), started.elapsed());
                return Err(Error::HandlerTimeout(timeout));
            },
            Err(e) => {
                reaper.terminate();
                return Err(Error::Io(e));
            }
        };

        let (mut out, mut err) = (None, None);
        let (out, err) = loop {
            match (out.take(), err.take()) {
                (Some(o), Some(e)) => break (o, e),
                (o, e) => {
                    out = o;
                    err = e;
                }
            }

            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok((Stream::Stdout, read)) => out = Some(read?),
                Ok((Stream::Stderr, read)) => err = Some(read?),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Handler {} exited but something kept its output open past {:?}",
                          script.display(), timeout);
                    return Err(Error::HandlerTimeout(timeout));
                },
                Err(RecvTimeoutError::Disconnected) =>
                    return Err(Error::Io(io::Error::new(io::ErrorKind::Other,
                                                        "handler output reader stopped")))
            }
        };
        let elapsed = started.elapsed();

        if err.overflowed {
            warn!("Handler {} wrote more than {} bytes to stderr; the rest was dropped",
                  script.display(), max_stderr);
        }
        if out.overflowed {
            return Err(Error::OutputLimit("stdout"));
        }

        Ok(HandlerInvocation {
            stdout: out.bytes,
            stderr: err.bytes,
            status,
            elapsed
        })
    }
}

enum Stream {
    Stdout,
    Stderr
}

/// Reads one of the child's streams on its own thread, reporting once at EOF.
///
/// The thread is detached; it outlives the request only while some process
/// outside the handler's group still holds the pipe.
fn spawn_reader<R>(stream: Stream, source: Option<R>, limit: usize,
                   tx: Sender<(Stream, io::Result<Bounded>)>)
    where R: Read + Send + 'static
{
    thread::spawn(move || {
        // The request may have given up waiting
        let _ = tx.send((stream, read_bounded(source, limit)));
    });
}

/// Output from one stream, cut at a limit
#[derive(Debug, Default)]
struct Bounded {
    bytes: Vec<u8>,
    overflowed: bool
}

/// Reads `source` to EOF, keeping at most `limit` bytes.
///
/// Keeps draining past the limit so the writer never blocks on a full pipe.
fn read_bounded<R: Read>(source: Option<R>, limit: usize) -> io::Result<Bounded> {
    let mut read = Bounded::default();
    let mut source = match source {
        Some(s) => s,
        None => return Ok(read)
    };

    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match source.read(&mut chunk) {
            Ok(0) => return Ok(read),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e)
        };

        let room = limit - read.bytes.len();
        if n > room {
            read.overflowed = true;
        }
        read.bytes.extend_from_slice(&chunk[.. n.min(room)]);
    }
}

/// Owns a child until it has been reaped, killing its group if dropped early
struct Reaper {
    child: Child,
    reaped: bool
}

impl Reaper {
    fn new(child: Child) -> Reaper {
        Reaper { child, reaped: false }
    }

    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let status = self.child.wait_timeout(timeout)?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    fn kill_group(&self) {
        // The group may already be empty
        let _ = killpg(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL);
    }

    fn terminate(&mut self) {
        if self.reaped {
            self.kill_group();
            return;
        }

        self.kill_group();
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(_) => self.reaped = true,
            Err(e) => error!("Could not reap handler pid {}: {}", self.child.id(), e)
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if !self.reaped {
            self.terminate();
        }
    }
}

/// Counting semaphore bounding concurrent handlers
struct Slots {
    max: usize,
    in_use: Mutex<usize>,
    freed: Condvar
}

struct SlotGuard<'a> {
    slots: &'a Slots
}

impl Slots {
    fn new(max: usize) -> Slots {
        Slots {
            max: max.max(1),
            in_use: Mutex::new(0),
            freed: Condvar::new()
        }
    }

    fn lock(&self) -> MutexGuard<usize> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> SlotGuard {
        let mut in_use = self.lock();
        while *in_use >= self.max {
            in_use = self.freed.wait(in_use).unwrap_or_else(PoisonError::into_inner);
        }
        *in_use += 1;
        SlotGuard { slots: self }
    }

    fn in_flight(&self) -> usize {
        *self.lock()
    }
}

impl<'a> Drop for SlotGuard<'a> {
    fn drop(&mut self) {
        let mut in_use = self.slots.lock();
        *in_use -= 1;
        self.slots.freed.notify_one();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use nix::errno::Errno;
    use nix::sys::signal::kill;

    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn config() -> CgiConfig {
        let mut config = CgiConfig::default();
        config.interpreters.insert(String::from("sh"), PathBuf::from("sh"));
        config
    }

    fn script(dir: &Path, name: &str, body: &str) -> CgiEnvironment {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();

        let mut env = CgiEnvironment::new();
        env.insert("SCRIPT_FILENAME", path.to_string_lossy());
        env.insert("REQUEST_METHOD", "POST");
        env
    }

    #[test]
    fn runs_with_environment_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let env = script(dir.path(), "echo.sh",
                         "printf 'Content-Type: text/plain\\n\\n'\n\
                          printf '%s:' \"$REQUEST_METHOD\"\n\
                          cat\n");

        let run = LocalInvoker::new(&config())
            .invoke(&env, b"hello", Duration::from_secs(5)).unwrap();

        assert!(run.status.success());
        assert_eq!(run.stdout, b"Content-Type: text/plain\n\nPOST:hello".to_vec());
        assert!(run.stderr.is_empty());
    }

    #[test]
    fn runs_in_the_script_directory() {
        let dir = tempfile::tempdir().unwrap();
        let env = script(dir.path(), "pwd.sh", "pwd\n");

        let run = LocalInvoker::new(&config())
            .invoke(&env, b"", Duration::from_secs(5)).unwrap();

        let reported = PathBuf::from(String::from_utf8(run.stdout).unwrap().trim());
        assert_eq!(reported.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn non_zero_exit_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let env = script(dir.path(), "fail.sh", "echo oops >&2\nexit 3\n");

        let run = LocalInvoker::new(&config())
            .invoke(&env, b"", Duration::from_secs(5)).unwrap();

        assert_eq!(run.status.code(), Some(3));
        assert!(run.stdout.is_empty());
        assert_eq!(run.stderr, b"oops\n".to_vec());
    }

    #[test]
    fn heavy_stderr_does_not_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        // Far more than a pipe buffer on stderr before any stdout
        let env = script(dir.path(), "noisy.sh",
                         "i=0\nwhile [ $i -lt 4000 ]; do\n\
                          echo 'diagnostic noise diagnostic noise diagnostic noise' >&2\n\
                          i=$((i+1))\ndone\n\
                          printf 'Content-Type: text/plain\\n\\nok'\n");

        let mut config = config();
        config.max_stderr_bytes = 1024;
        let run = LocalInvoker::new(&config)
            .invoke(&env, b"", Duration::from_secs(20)).unwrap();

        assert_eq!(run.stdout, b"Content-Type: text/plain\n\nok".to_vec());
        assert_eq!(run.stderr.len(), 1024);
    }

    #[test]
    fn stdout_past_the_limit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let env = script(dir.path(), "big.sh",
                         "printf 'Content-Type: text/plain\\n\\n'\n\
                          i=0\nwhile [ $i -lt 100 ]; do echo 0123456789; i=$((i+1)); done\n");

        let mut config = config();
        config.max_stdout_bytes = 64;
        match LocalInvoker::new(&config).invoke(&env, b"", Duration::from_secs(5)) {
            Err(Error::OutputLimit("stdout")) => (),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn timeout_kills_the_handler() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let env = script(dir.path(), "slow.sh",
                         &format!("echo $$ > '{}'\nexec sleep 30\n", pidfile.display()));

        let started = Instant::now();
        match LocalInvoker::new(&config()).invoke(&env, b"", Duration::from_millis(300)) {
            Err(Error::HandlerTimeout(limit)) => assert_eq!(limit, Duration::from_millis(300)),
            other => panic!("{:?}", other)
        }
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid: i32 = fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
        assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
    }

    #[test]
    fn detached_processes_cannot_outlast_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let env = script(dir.path(), "detach.sh",
                         "setsid sleep 5 &\n\
                          sleep 0.2\n\
                          printf 'Content-Type: text/plain\\n\\nok'\n");

        let invoker = LocalInvoker::new(&config());
        let started = Instant::now();
        match invoker.invoke(&env, b"", Duration::from_millis(500)) {
            Err(Error::HandlerTimeout(limit)) => assert_eq!(limit, Duration::from_millis(500)),
            other => panic!("{:?}", other)
        }

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(invoker.in_flight(), 0);
    }

    #[test]
    fn missing_interpreter_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = script(dir.path(), "x.sh", "echo hi\n");

        let mut config = config();
        config.interpreters.insert(String::from("sh"),
                                   PathBuf::from("/nonexistent/interpreter"));
        match LocalInvoker::new(&config).invoke(&env, b"", Duration::from_secs(5)) {
            Err(Error::Launch(_)) => (),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn missing_script_filename_never_launches() {
        match LocalInvoker::new(&config())
            .invoke(&CgiEnvironment::new(), b"", Duration::from_secs(5))
        {
            Err(Error::Configuration(_)) => (),
            other => panic!("{:?}", other)
        }
    }

    #[test]
    fn slots_bound_concurrency() {
        let slots = Arc::new(Slots::new(1));
        let acquired = Arc::new(AtomicBool::new(false));

        let first = slots.acquire();
        assert_eq!(slots.in_flight(), 1);

        let waiter = {
            let slots = Arc::clone(&slots);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _slot = slots.acquire();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(slots.in_flight(), 0);
    }

    #[test]
    fn read_bounded_drains_past_the_limit() {
        let data = vec![b'x'; 3 * READ_CHUNK];
        let read = read_bounded(Some(&data[..]), 10).unwrap();
        assert_eq!(read.bytes.len(), 10);
        assert!(read.overflowed);

        let read = read_bounded(Some(&data[..]), data.len()).unwrap();
        assert!(!read.overflowed);
        assert!(read_bounded(None::<&[u8]>, 10).unwrap().bytes.is_empty());
    }
}

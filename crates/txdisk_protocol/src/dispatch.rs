//! Executes requests against an engine.

use crate::error::ProtocolResult;
use crate::frame::{read_frame, write_frame};
use crate::handles::{Handle, HostedObjects};
use crate::message::{ErrorKind, RemoteError, Request, Response};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};
use txdisk_core::{
    Engine, InputStream, OutputStream, Session, SessionKind, TransactionIdentifier, XaResource, XaSession,
};

/// Largest read answered in one response.
const MAX_READ: u32 = 1024 * 1024;

enum HostedSession {
    Local(Session),
    Xa(XaSession),
}

impl HostedSession {
    fn session(&self) -> &Session {
        match self {
            Self::Local(session) => session,
            Self::Xa(xa) => xa.session(),
        }
    }
}

enum HostedStream {
    Input(InputStream),
    Output(OutputStream),
}

/// Serves one remote client.
///
/// Sessions and streams the client opens stay here until it closes them
/// or the dispatcher is dropped.
pub struct Dispatcher {
    engine: Engine,
    sessions: HostedObjects<HostedSession>,
    streams: HostedObjects<HostedStream>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sessions", &self.sessions.len())
            .field("streams", &self.streams.len())
            .finish()
    }
}

fn unknown(handle: Handle, what: &str) -> RemoteError {
    RemoteError::new(ErrorKind::UnknownHandle, format!("no {what} with handle {handle}"))
}

impl Dispatcher {
    /// Creates a dispatcher for `engine`.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            sessions: HostedObjects::new(),
            streams: HostedObjects::new(),
        }
    }

    /// Number of sessions currently hosted.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Executes one request.
    pub fn dispatch(&mut self, request: Request) -> Response {
        self.execute(request).unwrap_or_else(Response::Error)
    }

    /// Reads requests from `reader` and writes each response to `writer`
    /// until the client closes its side.
    ///
    /// # Errors
    ///
    /// Fails on a framing or I/O error; hosted objects are kept.
    pub fn serve<R: Read, W: Write>(&mut self, reader: &mut R, writer: &mut W) -> ProtocolResult<()> {
        while let Some(request) = read_frame::<_, Request>(reader)? {
            let response = self.dispatch(request);
            write_frame(writer, &response)?;
        }
        debug!(sessions = self.sessions.len(), "client disconnected");
        Ok(())
    }

    fn session(&self, handle: Handle) -> Result<&Session, RemoteError> {
        self.sessions
            .get(handle)
            .map(HostedSession::session)
            .ok_or_else(|| unknown(handle, "session"))
    }

    fn xa(&self, handle: Handle) -> Result<&XaResource, RemoteError> {
        match self.sessions.get(handle) {
            Some(HostedSession::Xa(xa)) => Ok(xa.xa_resource()),
            _ => Err(unknown(handle, "XA session")),
        }
    }

    fn input(&mut self, handle: Handle) -> Result<&mut InputStream, RemoteError> {
        match self.streams.get_mut(handle) {
            Some(HostedStream::Input(stream)) => Ok(stream),
            _ => Err(unknown(handle, "input stream")),
        }
    }

    fn output(&mut self, handle: Handle) -> Result<&mut OutputStream, RemoteError> {
        match self.streams.get_mut(handle) {
            Some(HostedStream::Output(stream)) => Ok(stream),
            _ => Err(unknown(handle, "output stream")),
        }
    }

    fn execute(&mut self, request: Request) -> Result<Response, RemoteError> {
        let response = match request {
            Request::OpenSession { publish_events } => {
                let session = if publish_events {
                    self.engine.create_session_with_events()?
                } else {
                    self.engine.create_session()?
                };
                Response::Session(self.sessions.insert(HostedSession::Local(session)))
            }
            Request::OpenXaSession => {
                let xa = self.engine.xa_session();
                Response::Session(self.sessions.insert(HostedSession::Xa(xa)))
            }
            Request::CloseSession { session } => {
                let hosted = self.sessions.remove(session).ok_or_else(|| unknown(session, "session"))?;
                let inner = hosted.session();
                if inner.kind() == SessionKind::Local && inner.transaction_id().is_some() {
                    if let Err(e) = inner.rollback() {
                        warn!(error = %e, "rollback on close failed");
                    }
                }
                Response::Done
            }
            Request::SetLockWaitTimeout { session, millis } => {
                self.session(session)?.set_lock_wait_timeout(Duration::from_millis(millis));
                Response::Done
            }
            Request::SetTransactionTimeout { session, seconds } => {
                self.session(session)?.set_transaction_timeout(seconds);
                Response::Done
            }

            Request::CreateFile {
                session,
                path,
                directory,
            } => {
                self.session(session)?.create_file(&path, directory)?;
                Response::Done
            }
            Request::DeleteFile { session, path } => {
                self.session(session)?.delete_file(&path)?;
                Response::Done
            }
            Request::CopyFile {
                session,
                source,
                destination,
            } => {
                self.session(session)?.copy_file(&source, &destination)?;
                Response::Done
            }
            Request::MoveFile {
                session,
                source,
                destination,
            } => {
                self.session(session)?.move_file(&source, &destination)?;
                Response::Done
            }
            Request::TruncateFile { session, path, length } => {
                self.session(session)?.truncate_file(&path, length)?;
                Response::Done
            }
            Request::FileExists {
                session,
                path,
                exclusive,
            } => Response::Bool(self.session(session)?.file_exists(&path, exclusive)?),
            Request::IsDirectory {
                session,
                path,
                exclusive,
            } => Response::Bool(self.session(session)?.file_exists_and_is_directory(&path, exclusive)?),
            Request::ListFiles { session, path } => Response::Names(self.session(session)?.list_files(&path)?),
            Request::FileLength {
                session,
                path,
                exclusive,
            } => Response::Length(self.session(session)?.file_length(&path, exclusive)?),

            Request::OpenInputStream {
                session,
                path,
                exclusive,
            } => {
                let stream = self.session(session)?.open_input_stream(&path, exclusive)?;
                Response::Stream(self.streams.insert(HostedStream::Input(stream)))
            }
            Request::OpenOutputStream {
                session,
                path,
                heavy_write,
            } => {
                let stream = self.session(session)?.open_output_stream(&path, heavy_write)?;
                Response::Stream(self.streams.insert(HostedStream::Output(stream)))
            }
            Request::Read { stream, max_len } => {
                let mut buf = vec![0u8; max_len.min(MAX_READ) as usize];
                let n = self.input(stream)?.read_bytes(&mut buf)?;
                buf.truncate(n);
                Response::Bytes(buf)
            }
            Request::Skip { stream, count } => Response::Length(self.input(stream)?.skip(count)?),
            Request::Available { stream } => Response::Length(self.input(stream)?.available()?),
            Request::Write { stream, data } => {
                self.output(stream)?.write_bytes(&data)?;
                Response::Done
            }
            Request::Flush { stream } => {
                self.output(stream)?.flush_bytes()?;
                Response::Done
            }
            Request::CloseStream { stream } => {
                match self.streams.remove(stream).ok_or_else(|| unknown(stream, "stream"))? {
                    HostedStream::Input(mut input) => input.close(),
                    HostedStream::Output(mut output) => output.close(),
                }
                Response::Done
            }

            Request::Commit { session } => {
                self.session(session)?.commit()?;
                Response::Done
            }
            Request::Rollback { session } => {
                self.session(session)?.rollback()?;
                Response::Done
            }

            Request::XaStart { session, xid, flag } => {
                self.xa(session)?.start(&xid, flag)?;
                Response::Done
            }
            Request::XaEnd { session, xid, flag } => {
                self.xa(session)?.end(&xid, flag)?;
                Response::Done
            }
            Request::XaPrepare { session, xid } => Response::Vote(self.xa(session)?.prepare(&xid)?),
            Request::XaCommit {
                session,
                xid,
                one_phase,
            } => {
                self.xa(session)?.commit(&xid, one_phase)?;
                Response::Done
            }
            Request::XaRollback { session, xid } => {
                self.xa(session)?.rollback(&xid)?;
                Response::Done
            }
            Request::XaRecover { session, flag } => Response::Xids(self.xa(session)?.recover(flag)?),
            Request::XaForget { session, xid } => {
                self.xa(session)?.forget(&xid)?;
                Response::Done
            }
            Request::XaSetTimeout { session, seconds } => {
                Response::Bool(self.xa(session)?.set_transaction_timeout(seconds)?)
            }
            Request::XaGetTimeout { session } => Response::Length(self.xa(session)?.transaction_timeout()),

            Request::FailedTransactions => Response::Identifiers(
                self.engine
                    .failed_transactions()
                    .iter()
                    .map(TransactionIdentifier::to_bytes)
                    .collect(),
            ),
            Request::DeclareComplete { identifier } => {
                let ident = TransactionIdentifier::from_bytes(&identifier)?;
                self.engine.declare_transaction_complete(&ident)?;
                Response::Done
            }
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;
    use txdisk_core::{Config, EndFlag, RecoverFlag, StartFlag, Vote, XaErrorCode, Xid};

    fn engine(dir: &std::path::Path) -> Engine {
        let config = Config::new(dir)
            .synchronous_recovery(true)
            .lock_wait_timeout(Duration::from_millis(200));
        Engine::boot(config).unwrap()
    }

    fn open(d: &mut Dispatcher) -> Handle {
        match d.dispatch(Request::OpenSession { publish_events: false }) {
            Response::Session(h) => h,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn local_session_round_trip() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut d = Dispatcher::new(engine.clone());

        let s = open(&mut d);
        let create = Request::CreateFile {
            session: s,
            path: "/notes".into(),
            directory: false,
        };
        assert_eq!(d.dispatch(create), Response::Done);
        let Response::Stream(out) = d.dispatch(Request::OpenOutputStream {
            session: s,
            path: "/notes".into(),
            heavy_write: false,
        }) else {
            panic!("expected a stream");
        };
        assert_eq!(
            d.dispatch(Request::Write {
                stream: out,
                data: b"remote".to_vec()
            }),
            Response::Done
        );
        assert_eq!(d.dispatch(Request::CloseStream { stream: out }), Response::Done);
        assert_eq!(d.dispatch(Request::Commit { session: s }), Response::Done);
        assert_eq!(d.dispatch(Request::CloseSession { session: s }), Response::Done);

        let r = open(&mut d);
        let Response::Stream(input) = d.dispatch(Request::OpenInputStream {
            session: r,
            path: "/notes".into(),
            exclusive: false,
        }) else {
            panic!("expected a stream");
        };
        assert_eq!(d.dispatch(Request::Available { stream: input }), Response::Length(6));
        assert_eq!(
            d.dispatch(Request::Read {
                stream: input,
                max_len: 100
            }),
            Response::Bytes(b"remote".to_vec())
        );
        assert_eq!(d.dispatch(Request::CloseSession { session: r }), Response::Done);
        assert_eq!(d.open_sessions(), 0);
        engine.shutdown();
    }

    #[test]
    fn errors_carry_their_kind() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut d = Dispatcher::new(engine.clone());
        let s = open(&mut d);

        let Response::Error(err) = d.dispatch(Request::DeleteFile {
            session: s,
            path: "/absent".into(),
        }) else {
            panic!("expected an error");
        };
        assert_eq!(err.kind, ErrorKind::FileNotExists);

        let Response::Error(err) = d.dispatch(Request::Commit { session: 99 }) else {
            panic!("expected an error");
        };
        assert_eq!(err.kind, ErrorKind::UnknownHandle);

        // a local session is not an XA resource
        let Response::Error(err) = d.dispatch(Request::XaRecover {
            session: s,
            flag: RecoverFlag::StartEndScan,
        }) else {
            panic!("expected an error");
        };
        assert_eq!(err.kind, ErrorKind::UnknownHandle);
        engine.shutdown();
    }

    #[test]
    fn xa_branch_over_the_wire() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut d = Dispatcher::new(engine.clone());
        let Response::Session(xa) = d.dispatch(Request::OpenXaSession) else {
            panic!("expected a session");
        };
        let xid = Xid::new(1, b"gtrid".to_vec(), b"b".to_vec());

        let mut requests = Vec::new();
        for request in [
            Request::XaStart {
                session: xa,
                xid: xid.clone(),
                flag: StartFlag::NoFlags,
            },
            Request::CreateFile {
                session: xa,
                path: "/xa".into(),
                directory: true,
            },
            Request::XaEnd {
                session: xa,
                xid: xid.clone(),
                flag: EndFlag::Success,
            },
            Request::XaPrepare {
                session: xa,
                xid: xid.clone(),
            },
            Request::XaCommit {
                session: xa,
                xid: xid.clone(),
                one_phase: false,
            },
            Request::XaCommit {
                session: xa,
                xid: xid.clone(),
                one_phase: false,
            },
        ] {
            write_frame(&mut requests, &request).unwrap();
        }

        let mut replies = Vec::new();
        d.serve(&mut Cursor::new(requests), &mut replies).unwrap();
        let mut replies = Cursor::new(replies);
        let mut read = || read_frame::<_, Response>(&mut replies).unwrap().unwrap();
        assert_eq!(read(), Response::Done);
        assert_eq!(read(), Response::Done);
        assert_eq!(read(), Response::Done);
        assert_eq!(read(), Response::Vote(Vote::Ok));
        assert_eq!(read(), Response::Done);
        let Response::Error(err) = read() else {
            panic!("second commit must fail");
        };
        assert_eq!(err.kind, ErrorKind::Xa(XaErrorCode::Inval));

        assert!(dir.path().join("data/xa").is_dir());
        engine.shutdown();
    }

    #[test]
    fn failed_transactions_are_listed_as_bytes() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut d = Dispatcher::new(engine.clone());
        assert_eq!(d.dispatch(Request::FailedTransactions), Response::Identifiers(Vec::new()));

        let Response::Error(err) = d.dispatch(Request::DeclareComplete {
            identifier: vec![9, 9],
        }) else {
            panic!("expected an error");
        };
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        engine.shutdown();
    }
}

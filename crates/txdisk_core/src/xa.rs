//! The global-transaction branch surface.
//!
//! An external transaction manager drives branches through an
//! [`XaResource`]: `start` associates a branch with the session, `end`
//! detaches it, and `prepare`/`commit`/`rollback` decide it. Failures are
//! reported with the usual XA error codes.

use crate::engine::EngineShared;
use crate::error::TxError;
use crate::session::Session;
use crate::transaction::{Transaction, TransactionManager, TransactionState, Vote};
use crate::types::Xid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// XA error codes used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XaErrorCode {
    /// The resource manager failed or is unavailable.
    RmFail,
    /// Invalid arguments, including an unknown branch.
    Inval,
    /// Work is being done outside a global transaction.
    Outside,
    /// The call was made in the wrong state.
    Proto,
}

impl XaErrorCode {
    /// The numeric code defined by X/Open XA.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::RmFail => -7,
            Self::Inval => -5,
            Self::Outside => -9,
            Self::Proto => -6,
        }
    }
}

impl fmt::Display for XaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RmFail => "XAER_RMFAIL",
            Self::Inval => "XAER_INVAL",
            Self::Outside => "XAER_OUTSIDE",
            Self::Proto => "XAER_PROTO",
        };
        f.write_str(name)
    }
}

/// An XA failure with the engine error behind it.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct XaError {
    /// The XA error code.
    pub code: XaErrorCode,
    message: String,
    /// The underlying engine error, if there is one.
    #[source]
    pub source: Option<TxError>,
}

impl XaError {
    /// Creates an error with a message and no engine error behind it.
    pub fn new(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    fn unknown(xid: &Xid) -> Self {
        Self::new(XaErrorCode::Inval, format!("unknown branch {xid}"))
    }

    fn protocol(xid: &Xid, state: TransactionState, call: &str) -> Self {
        Self::new(XaErrorCode::Proto, format!("{call} on {xid} in state {state}"))
    }
}

impl From<TxError> for XaError {
    fn from(err: TxError) -> Self {
        let code = match &err {
            TxError::NoTransactionAssociated | TxError::TransactionRolledBack { .. } => XaErrorCode::Outside,
            TxError::InvalidArgument { .. } | TxError::InvalidPath(_) => XaErrorCode::Inval,
            _ => XaErrorCode::RmFail,
        };
        Self {
            code,
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Result type for XA calls.
pub type XaResult<T> = Result<T, XaError>;

/// Flag for [`XaResource::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartFlag {
    /// Start a new branch.
    NoFlags,
    /// Join an existing branch.
    Join,
    /// Resume a suspended branch.
    Resume,
}

/// Flag for [`XaResource::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndFlag {
    /// The work finished successfully.
    Success,
    /// The work failed; the transaction manager will roll back.
    Fail,
    /// The branch is suspended and may be resumed.
    Suspend,
}

/// Flag for [`XaResource::recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoverFlag {
    /// Continue the current scan.
    NoFlags,
    /// Start a new scan.
    StartScan,
    /// End the scan.
    EndScan,
    /// Start and end a scan in one call.
    StartEndScan,
}

impl RecoverFlag {
    fn starts(self) -> bool {
        matches!(self, Self::StartScan | Self::StartEndScan)
    }
}

/// A session whose transactions belong to global transactions.
#[derive(Debug)]
pub struct XaSession {
    session: Arc<Session>,
    resource: XaResource,
}

impl XaSession {
    pub(crate) fn new(engine: Arc<EngineShared>) -> Self {
        let session = Arc::new(Session::xa(engine));
        let resource = XaResource {
            session: Arc::clone(&session),
            scan_returned: Mutex::new(false),
        };
        Self { session, resource }
    }

    /// The session used for file operations of the current branch.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The resource the transaction manager talks to.
    #[must_use]
    pub fn xa_resource(&self) -> &XaResource {
        &self.resource
    }
}

/// The branch protocol of one [`XaSession`].
pub struct XaResource {
    session: Arc<Session>,
    scan_returned: Mutex<bool>,
}

impl fmt::Debug for XaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaResource")
            .field("instance_id", &self.engine().instance_id)
            .finish_non_exhaustive()
    }
}

impl XaResource {
    fn engine(&self) -> &Arc<EngineShared> {
        self.session.engine()
    }

    fn manager(&self) -> &Arc<TransactionManager> {
        &self.engine().manager
    }

    fn lookup(&self, xid: &Xid) -> XaResult<Arc<Transaction>> {
        self.manager().registry().by_xid(xid).ok_or_else(|| XaError::unknown(xid))
    }

    fn available(&self) -> XaResult<()> {
        self.engine().check_available().map_err(XaError::from)
    }

    /// Associates a branch with the session.
    ///
    /// # Errors
    ///
    /// - `XAER_PROTO` if the session already has a branch or the branch
    ///   is not active.
    /// - `XAER_INVAL` for a duplicate new branch or an unknown one to
    ///   join or resume.
    /// - `XAER_RMFAIL` if the engine cannot take new work.
    pub fn start(&self, xid: &Xid, flag: StartFlag) -> XaResult<()> {
        if let Some(current) = self.session.bound() {
            return Err(XaError::new(
                XaErrorCode::Proto,
                format!("session is already associated with {}", current.ident()),
            ));
        }
        let tx = match flag {
            StartFlag::NoFlags => {
                self.engine().admit().map_err(|e| XaError {
                    code: XaErrorCode::RmFail,
                    message: e.to_string(),
                    source: Some(e),
                })?;
                if !xid.is_well_formed() {
                    return Err(XaError::new(XaErrorCode::Inval, format!("malformed branch id {xid}")));
                }
                self.manager().begin(
                    Some(xid.clone()),
                    self.session.transaction_timeout(),
                    self.session.publishes_events(),
                    None,
                )?
            }
            StartFlag::Join | StartFlag::Resume => {
                self.available()?;
                let tx = self.lookup(xid)?;
                if tx.state() != TransactionState::Active {
                    return Err(XaError::protocol(xid, tx.state(), "start"));
                }
                tx
            }
        };
        debug!(%xid, ?flag, "branch associated");
        self.session.bind(Some(tx));
        Ok(())
    }

    /// Detaches the branch from the session without changing it.
    ///
    /// # Errors
    ///
    /// - `XAER_INVAL` for an unknown branch.
    /// - `XAER_PROTO` if the branch is not the one associated.
    pub fn end(&self, xid: &Xid, flag: EndFlag) -> XaResult<()> {
        let tx = self.lookup(xid)?;
        match self.session.bound() {
            Some(current) if current.id() == tx.id() => {
                self.session.bind(None);
                debug!(%xid, ?flag, "branch detached");
                Ok(())
            }
            _ => Err(XaError::new(
                XaErrorCode::Proto,
                format!("{xid} is not associated with this session"),
            )),
        }
    }

    /// Prepares a branch.
    ///
    /// # Errors
    ///
    /// - `XAER_INVAL` for an unknown branch.
    /// - `XAER_PROTO` if the branch is not active.
    /// - `XAER_RMFAIL` if the prepare record cannot be written.
    pub fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        self.available()?;
        let tx = self.lookup(xid)?;
        let mut work = tx.work();
        if tx.state() != TransactionState::Active {
            return Err(XaError::protocol(xid, tx.state(), "prepare"));
        }
        let vote = self.manager().prepare(&tx, &mut work)?;
        debug!(%xid, ?vote, "branch prepared");
        Ok(vote)
    }

    /// Commits a branch; with `one_phase` an active branch is prepared and
    /// committed with one log write.
    ///
    /// # Errors
    ///
    /// - `XAER_INVAL` for an unknown branch.
    /// - `XAER_PROTO` if the branch is not in the state the call needs.
    /// - `XAER_RMFAIL` if the commit cannot complete.
    pub fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        self.available()?;
        let tx = self.lookup(xid)?;
        let events = {
            let mut work = tx.work();
            let state = tx.state();
            match (one_phase, state) {
                (true, TransactionState::Active) => self.manager().commit_one_phase(&tx, &mut work)?,
                (false, TransactionState::Prepared) => self.manager().commit_prepared(&tx, &mut work)?,
                _ => return Err(XaError::protocol(xid, state, "commit")),
            }
        };
        self.engine().events.enqueue(events);
        debug!(%xid, one_phase, "branch committed");
        Ok(())
    }

    /// Rolls a branch back.
    ///
    /// # Errors
    ///
    /// - `XAER_INVAL` for an unknown branch.
    /// - `XAER_PROTO` if the branch is neither active nor prepared.
    /// - `XAER_RMFAIL` if the rollback record cannot be written.
    pub fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.available()?;
        let tx = self.lookup(xid)?;
        let mut work = tx.work();
        let state = tx.state();
        if !matches!(state, TransactionState::Active | TransactionState::Prepared) {
            return Err(XaError::protocol(xid, state, "rollback"));
        }
        self.manager().rollback(&tx, &mut work)?;
        debug!(%xid, "branch rolled back");
        Ok(())
    }

    /// Lists prepared branches waiting for a decision, live and
    /// recovered. Once a scan has returned them, later calls return
    /// nothing until a new scan is started.
    ///
    /// # Errors
    ///
    /// `XAER_RMFAIL` if the engine is unavailable.
    pub fn recover(&self, flag: RecoverFlag) -> XaResult<Vec<Xid>> {
        self.available()?;
        let mut returned = self.scan_returned.lock();
        if flag.starts() {
            *returned = false;
        }
        if *returned {
            return Ok(Vec::new());
        }
        *returned = true;
        let xids = self.manager().registry().prepared_xids();
        info!(count = xids.len(), "in-doubt branches reported");
        Ok(xids)
    }

    /// Forgets a heuristically completed branch. The engine makes no
    /// heuristic decisions, so there is never anything to forget.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn forget(&self, xid: &Xid) -> XaResult<()> {
        debug!(%xid, "forget ignored");
        Ok(())
    }

    /// True if both resources belong to the same engine instance.
    #[must_use]
    pub fn is_same_rm(&self, other: &XaResource) -> bool {
        self.engine().instance_id == other.engine().instance_id
    }

    /// Sets the timeout for branches started later, in seconds. Zero
    /// restores the default.
    ///
    /// # Errors
    ///
    /// `XAER_INVAL` for a negative value.
    pub fn set_transaction_timeout(&self, seconds: i64) -> XaResult<bool> {
        let seconds = u32::try_from(seconds)
            .map_err(|_| XaError::new(XaErrorCode::Inval, format!("invalid timeout {seconds}")))?;
        self.session.set_transaction_timeout(seconds);
        Ok(true)
    }

    /// Current timeout in seconds.
    #[must_use]
    pub fn transaction_timeout(&self) -> u64 {
        self.session.transaction_timeout().as_secs()
    }
}

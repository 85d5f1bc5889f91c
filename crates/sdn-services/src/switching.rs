//! Layer-2 switching — the fixed forwarding behavior pushed to every
//! admitted datapath.
//!
//! The controller keeps no MAC table. It installs one table-miss rule whose
//! action is `output:NORMAL`, handing every frame to the switch's own
//! flood-and-learn pipeline. Rules are re-derived from `SwitchingParams` on
//! every install; nothing about earlier pushes is remembered.

use std::collections::HashSet;
use std::time::Duration;

use sdn_core::config::SwitchingConfig;
use sdn_core::wire::OFPP_NORMAL;
use sdn_core::{FlowMod, FlowModCommand, Identity, Message};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::transport::{Connection, TransportError};

/// Parameters of the installed switching rule. Independent of any session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchingParams {
    pub table_id: u8,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub cookie: u64,
    pub flush_existing: bool,
    pub ack_timeout: Duration,
    /// One extra attempt after a failed push.
    pub retry: bool,
}

impl Default for SwitchingParams {
    fn default() -> Self {
        Self::from(&SwitchingConfig::default())
    }
}

impl From<&SwitchingConfig> for SwitchingParams {
    fn from(c: &SwitchingConfig) -> Self {
        Self {
            table_id: c.table_id,
            priority: c.priority,
            idle_timeout: c.idle_timeout_secs,
            hard_timeout: c.hard_timeout_secs,
            cookie: c.cookie,
            flush_existing: c.flush_existing,
            ack_timeout: Duration::from_secs(c.ack_timeout_secs),
            retry: c.retry,
        }
    }
}

/// Why a single push attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("datapath rejected rule (xid {xid}): error type {err_type}, code {code}")]
    Rejected { xid: u32, err_type: u16, code: u16 },

    #[error("no barrier reply within {0:?}")]
    AckTimeout(Duration),
}

#[derive(Debug, Clone)]
pub struct L2Switching {
    params: SwitchingParams,
}

impl L2Switching {
    pub fn new(params: SwitchingParams) -> Self {
        Self { params }
    }

    /// Total attempts allowed for one install: one, plus the retry.
    pub fn max_attempts(&self) -> u32 {
        if self.params.retry {
            2
        } else {
            1
        }
    }

    /// The flow-mods that make up the default behavior, in push order.
    pub fn rules(&self) -> Vec<FlowMod> {
        let p = &self.params;
        let mut rules = Vec::with_capacity(2);
        if p.flush_existing {
            rules.push(FlowMod::delete_all());
        }
        rules.push(FlowMod {
            command: FlowModCommand::Add,
            table_id: p.table_id,
            priority: p.priority,
            idle_timeout: p.idle_timeout,
            hard_timeout: p.hard_timeout,
            cookie: p.cookie,
            output: Some(OFPP_NORMAL),
        });
        rules
    }

    /// Push the rules and wait for the barrier acknowledgement, retrying
    /// at most once. Returns the number of attempts on failure along with
    /// the last error.
    pub async fn install<T>(
        &self,
        conn: &mut Connection<T>,
        identity: Identity,
    ) -> Result<(), (u32, InstallError)>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let max = self.max_attempts();
        let mut attempt = 1;
        loop {
            match self.push_once(conn).await {
                Ok(()) => {
                    tracing::info!(%identity, attempt, "l2 switching installed");
                    return Ok(());
                }
                Err(e) if attempt < max => {
                    tracing::warn!(%identity, attempt, error = %e, "rule push failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    async fn push_once<T>(&self, conn: &mut Connection<T>) -> Result<(), InstallError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut pushed = HashSet::new();
        for rule in self.rules() {
            pushed.insert(conn.send(&Message::FlowMod(rule)).await?);
        }
        let barrier = conn.send(&Message::BarrierRequest).await?;
        tracing::trace!(rules = pushed.len(), barrier, "rules pushed, awaiting barrier");

        let deadline = Instant::now() + self.params.ack_timeout;
        loop {
            let envelope = match tokio::time::timeout_at(deadline, conn.recv()).await {
                Ok(r) => r?,
                Err(_) => return Err(InstallError::AckTimeout(self.params.ack_timeout)),
            };
            match envelope.message {
                Message::BarrierReply if envelope.xid == barrier => return Ok(()),
                Message::Error { err_type, code, .. }
                    if pushed.contains(&envelope.xid) || envelope.xid == barrier =>
                {
                    return Err(InstallError::Rejected {
                        xid: envelope.xid,
                        err_type,
                        code,
                    });
                }
                Message::EchoRequest(payload) => {
                    conn.reply(envelope.xid, &Message::EchoReply(payload)).await?;
                }
                other => {
                    tracing::trace!(xid = envelope.xid, message = ?other, "ignored while awaiting barrier");
                }
            }
        }
    }
}

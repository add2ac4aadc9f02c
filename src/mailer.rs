//! Outbound account mail. Delivery is pluggable; the default sender only logs.

use async_trait::async_trait;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailKind {
    ConfirmEmail,
    ResetPassword,
}

#[derive(Debug, Clone)]
pub struct Mail {
    pub kind: MailKind,
    pub to: String,
    pub link: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: Mail) -> anyhow::Result<()>;
}

/// Logs the message instead of delivering it.
#[derive(Clone, Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: Mail) -> anyhow::Result<()> {
        info!(to = %mail.to, kind = ?mail.kind, "mail send stub");
        debug!(link = %mail.link, "mail link");
        Ok(())
    }
}

/// Keeps every message in memory so tests can inspect links.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: std::sync::Mutex<Vec<Mail>>,
}

#[cfg(test)]
impl RecordingMailer {
    pub fn last(&self, kind: MailKind) -> Option<Mail> {
        let sent = self.sent.lock().unwrap();
        sent.iter().rev().find(|m| m.kind == kind).cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: Mail) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

/// Rejects every message, like an unreachable mail server.
#[cfg(test)]
pub struct FailingMailer;

#[cfg(test)]
#[async_trait]
impl Mailer for FailingMailer {
    async fn send(&self, _mail: Mail) -> anyhow::Result<()> {
        anyhow::bail!("smtp down")
    }
}

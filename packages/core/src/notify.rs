//! Exception report composition for the mail-notification collaborator
//!
//! Delivery over SMTP belongs to the notifier implementation; this module
//! only composes the message and hands it over. Failed deliveries are not
//! retried here.

use std::error::Error as StdError;
use std::fmt::Write as _;

use crate::config::NotificationSettings;

const PRODUCT: &str = "Veilgate";

/// Error classification plus textual trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionReport {
    pub classification: String,
    pub description: String,
    pub trace: String,
}

impl ExceptionReport {
    /// Walk the `source()` chain of `error` into a trace.
    pub fn from_error(classification: impl Into<String>, error: &(dyn StdError + 'static)) -> Self {
        let mut trace = format!("{error}");
        let mut source = error.source();
        let mut level = 1;
        while let Some(cause) = source {
            let _ = write!(trace, "\n  {level}: caused by: {cause}");
            source = cause.source();
            level += 1;
        }
        Self {
            classification: classification.into(),
            description: error.to_string(),
            trace,
        }
    }
}

/// A composed plain-text notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl ExceptionMail {
    pub fn compose(settings: &NotificationSettings, report: &ExceptionReport) -> Self {
        let from = format!(
            "{PRODUCT} Node {}.{} <{}>",
            settings.node_name, settings.base_host, settings.sender
        );
        let subject = format!(
            "{PRODUCT} Node Exception (IPV4: {}, IPv6: {})",
            settings.listen_ipv4, settings.listen_ipv6
        );
        let body = format!(
            "Exception from Node {} (IPV4: {}, IPv6: {})\n\
             {PRODUCT} version: {}\n\
             {} {}\n\
             {}\n",
            settings.node_name,
            settings.listen_ipv4,
            settings.listen_ipv6,
            env!("CARGO_PKG_VERSION"),
            report.classification,
            report.description,
            report.trace
        );
        Self {
            from,
            to: settings.exceptions_recipient.clone(),
            subject,
            body,
        }
    }

    /// RFC 822 text handed to the SMTP session
    pub fn to_message(&self) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\nContent-Type: text/plain; charset=ISO-8859-1\n\
             Content-Transfer-Encoding: 8bit\n\n{}",
            self.from, self.to, self.subject, self.body
        )
    }
}

/// Out-of-scope mail delivery, seen only through this seam
pub trait ExceptionNotifier: Send + Sync {
    fn deliver(&self, settings: &NotificationSettings, mail: ExceptionMail);
}

/// Writes notifications to the log instead of mailing them
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl ExceptionNotifier for TracingNotifier {
    fn deliver(&self, _settings: &NotificationSettings, mail: ExceptionMail) {
        tracing::error!(to = %mail.to, subject = %mail.subject, "{}", mail.body);
    }
}

/// Compose and hand an unrecoverable error to the notifier.
pub fn report_exception(
    settings: &NotificationSettings,
    notifier: &dyn ExceptionNotifier,
    classification: &str,
    error: &(dyn StdError + 'static),
) -> ExceptionMail {
    let report = ExceptionReport::from_error(classification, error);
    let mail = ExceptionMail::compose(settings, &report);
    notifier.deliver(settings, mail.clone());
    mail
}

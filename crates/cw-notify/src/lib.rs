//! Notification sinks and the fan-out that drives several of them at once.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cw_core::{Listing, Notifier, NotifyError};
use futures::future::join_all;
use lettre::message::{header::ContentType, Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cw-notify";

/// Delivers every configured sink and reports all failures together.
///
/// Sinks run concurrently; a failing sink never prevents the others from
/// being called. Failure messages keep the order the sinks were added in.
#[derive(Clone, Default)]
pub struct FanOutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanOutNotifier {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for FanOutNotifier {
    async fn send(&self, listing: &Listing, cancel: &CancellationToken) -> Result<(), NotifyError> {
        let results = join_all(self.sinks.iter().map(|sink| sink.send(listing, cancel))).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(Result::err)
            .map(|err| err.to_string())
            .collect();

        if failures.is_empty() {
            return Ok(());
        }
        warn!(
            listing_id = %listing.id,
            failed = failures.len(),
            sinks = self.sinks.len(),
            "some notification sinks failed"
        );
        Err(NotifyError::Aggregate(failures))
    }
}

/// Writes each notification as a structured log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        listing: &Listing,
        _cancel: &CancellationToken,
    ) -> Result<(), NotifyError> {
        info!(
            target: "notification",
            listing_id = %listing.id,
            title = %listing.title,
            price = listing.price,
            currency = %listing.currency,
            url = %listing.url,
            "notification sent"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub tls: bool,
}

/// Sends one HTML email per listing over SMTP.
pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailNotifier {
    /// Port 465 uses implicit TLS, every other port negotiates STARTTLS.
    /// With `tls` off the connection stays plaintext, for local relays only.
    /// No connection is opened until the first send.
    pub fn new(config: &EmailConfig) -> anyhow::Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .with_context(|| format!("invalid EMAIL_FROM {:?}", config.from))?;
        let to = config
            .to
            .iter()
            .map(|addr| addr.trim())
            .filter(|addr| !addr.is_empty())
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .with_context(|| format!("invalid EMAIL_TO entry {addr:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        anyhow::ensure!(!to.is_empty(), "email notifier needs at least one recipient");

        let builder = if !config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        } else if config.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .with_context(|| format!("invalid SMTP_HOST {:?}", config.smtp_host))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .with_context(|| format!("invalid SMTP_HOST {:?}", config.smtp_host))?
        }
        .port(config.smtp_port);

        let builder = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                builder.credentials(Credentials::new(user.clone(), pass.clone()))
            }
            _ => builder,
        };

        Ok(Self {
            mailer: builder.build(),
            from,
            to,
        })
    }

    pub fn build_message(&self, listing: &Listing) -> anyhow::Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("🔔 New Item: {}", listing.title))
            .header(ContentType::TEXT_HTML);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder.body(render_body(listing)).context("building email")
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, listing: &Listing, cancel: &CancellationToken) -> Result<(), NotifyError> {
        if cancel.is_cancelled() {
            return Err(NotifyError::Cancelled);
        }
        let delivery = |source: anyhow::Error| NotifyError::Delivery {
            channel: "email",
            listing_id: listing.id.clone(),
            source,
        };

        let message = self.build_message(listing).map_err(delivery)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NotifyError::Cancelled),
            sent = self.mailer.send(message) => sent
                .map(|_| ())
                .map_err(|err| delivery(anyhow::Error::new(err).context("smtp send"))),
        }
    }
}

pub fn render_body(listing: &Listing) -> String {
    let mut body = String::new();
    body.push_str("<h2>New Item Discovered!</h2><ul>");
    let _ = write!(
        body,
        "<li><strong>Title:</strong> {}</li>",
        html_escape::encode_text(&listing.title)
    );
    if listing.has_price() {
        let _ = write!(
            body,
            "<li><strong>Price:</strong> {:.2} {}</li>",
            listing.price,
            html_escape::encode_text(&listing.currency)
        );
    }
    let _ = write!(
        body,
        "<li><strong>Details:</strong> {}</li></ul>",
        html_escape::encode_text(&listing.description)
    );
    let _ = write!(
        body,
        "<br/><a href=\"{}\" style=\"background-color: #007bff; color: white; \
         padding: 10px 20px; text-decoration: none; border-radius: 5px; \
         font-family: Arial, sans-serif;\">View Item on Website</a><br/><br/>",
        html_escape::encode_double_quoted_attribute(&listing.url)
    );
    body.push_str("<p style='color: #888; font-size: 12px;'>Sent by Classifieds Watcher</p>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            listing: &Listing,
            _cancel: &CancellationToken,
        ) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(listing.id.clone());
            Ok(())
        }
    }

    struct FailingNotifier {
        message: &'static str,
        calls: Mutex<usize>,
    }

    impl FailingNotifier {
        fn new(message: &'static str) -> Self {
            Self {
                message,
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(
            &self,
            listing: &Listing,
            _cancel: &CancellationToken,
        ) -> Result<(), NotifyError> {
            *self.calls.lock().unwrap() += 1;
            Err(NotifyError::Delivery {
                channel: "test",
                listing_id: listing.id.clone(),
                source: anyhow::anyhow!(self.message),
            })
        }
    }

    fn listing() -> Listing {
        Listing::new("77", "Studio <centre>", "https://example.com/77?a=1&b=2")
            .with_price(512.5, "EUR")
            .with_description("20 m² - Strasbourg")
    }

    fn email_config() -> EmailConfig {
        EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: Some("bot@example.com".into()),
            password: Some("secret".into()),
            from: "Watcher Bot <bot@example.com>".into(),
            to: vec!["a@example.com".into(), " b@example.com ".into()],
            tls: false,
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_stop_the_others() {
        let failing = Arc::new(FailingNotifier::new("smtp down"));
        let recording = Arc::new(RecordingNotifier::default());
        let fan_out = FanOutNotifier::default()
            .with(failing.clone())
            .with(recording.clone());

        let err = fan_out.send(&listing(), &CancellationToken::new()).await.unwrap_err();

        assert!(err.to_string().contains("smtp down"), "{err}");
        assert_eq!(*failing.calls.lock().unwrap(), 1);
        assert_eq!(*recording.sent.lock().unwrap(), vec!["77".to_string()]);
    }

    #[tokio::test]
    async fn every_failure_is_aggregated_in_sink_order() {
        let fan_out = FanOutNotifier::new(vec![
            Arc::new(FailingNotifier::new("first broke")),
            Arc::new(RecordingNotifier::default()),
            Arc::new(FailingNotifier::new("second broke")),
        ]);

        match fan_out.send(&listing(), &CancellationToken::new()).await {
            Err(NotifyError::Aggregate(messages)) => {
                assert_eq!(messages.len(), 2);
                assert!(messages[0].contains("first broke"));
                assert!(messages[1].contains("second broke"));
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_fan_out_succeeds() {
        let fan_out = FanOutNotifier::default();
        assert!(fan_out.is_empty());
        fan_out.send(&listing(), &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        LogNotifier.send(&listing(), &CancellationToken::new()).await.unwrap();
    }

    #[test]
    fn body_escapes_text_and_includes_price_when_set() {
        let body = render_body(&listing());
        assert!(body.contains("Studio &lt;centre&gt;"));
        assert!(body.contains("<strong>Price:</strong> 512.50 EUR"));
        assert!(body.contains("href=\"https://example.com/77?a=1&amp;b=2\""));
        assert!(body.contains("20 m² - Strasbourg"));
    }

    #[test]
    fn body_omits_price_when_not_applicable() {
        let free = Listing::new("p1", "Rex", "https://example.com/rex");
        assert!(!render_body(&free).contains("Price:"));
    }

    #[tokio::test]
    async fn email_message_targets_every_recipient() {
        let notifier = EmailNotifier::new(&email_config()).expect("notifier");
        assert_eq!(notifier.to.len(), 2);

        let message = notifier.build_message(&listing()).expect("message");
        let raw = String::from_utf8(message.formatted()).expect("utf8");
        assert!(raw.contains("a@example.com"));
        assert!(raw.contains("b@example.com"));
        assert!(raw.contains("Subject:"));
    }

    #[tokio::test]
    async fn email_send_fails_fast_on_cancelled_token() {
        let notifier = EmailNotifier::new(&email_config()).expect("notifier");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = notifier.send(&listing(), &cancel).await.unwrap_err();
        assert!(matches!(err, NotifyError::Cancelled));
    }

    #[test]
    fn email_config_rejects_bad_addresses() {
        let mut config = email_config();
        config.to = vec!["not-an-address".into()];
        assert!(EmailNotifier::new(&config).is_err());

        let mut config = email_config();
        config.to = vec![];
        assert!(EmailNotifier::new(&config).is_err());
    }
}

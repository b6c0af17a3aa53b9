//! Tracing setup for binaries and test harnesses embedding the transport.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn base_level(raw: Option<&str>) -> &'static str {
    match raw {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directive(level: &str) -> String {
    // Per-connection framing chatter stays off unless asked for by RUST_LOG.
    format!("rpcvc={level},rpcvc::record=warn,rpcvc::xdr=warn")
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `RPCVC_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines. A second call is a no-op.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("RPCVC_LOG").ok().as_deref());
        EnvFilter::new(filter_directive(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("debug")), "debug");
        assert_eq!(base_level(Some("loud")), "info");
        assert_eq!(base_level(None), "info");
    }

    #[test]
    fn directive_quiets_framing() {
        insta::assert_snapshot!(
            filter_directive("debug"),
            @"rpcvc=debug,rpcvc::record=warn,rpcvc::xdr=warn"
        );
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}

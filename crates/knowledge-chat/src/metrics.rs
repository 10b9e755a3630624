use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};
use lazy_static::lazy_static;
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static CONTENTION_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static TERMINAL_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_REPLIES: OnceLock<IntGauge> = OnceLock::new();
static REPLY_DURATION: OnceLock<Histogram> = OnceLock::new();

pub fn init_metrics() -> anyhow::Result<()> {
    let req_counter = IntCounterVec::new(
        prometheus::opts!("chat_requests_total", "AI requests per agent kind"),
        &["agent"]
    )?;
    let contention = IntCounterVec::new(
        prometheus::opts!("chat_contention_total", "Requests rejected by dedup lock or duplicate id"),
        &["reason"]
    )?;
    let terminal = IntCounterVec::new(
        prometheus::opts!("chat_replies_total", "Assistant turns by terminal progress"),
        &["progress", "mode"]
    )?;
    let active = IntGauge::new("chat_active_replies", "Answers currently being generated")?;
    let duration = Histogram::with_opts(prometheus::HistogramOpts::new(
        "chat_reply_duration_seconds",
        "Time from accepted request to terminal turn state"
    ))?;

    // First initialization wins; later calls re-register the same collectors.
    let req_counter = REQ_COUNTER.get_or_init(|| req_counter);
    let contention = CONTENTION_COUNTER.get_or_init(|| contention);
    let terminal = TERMINAL_COUNTER.get_or_init(|| terminal);
    let active = ACTIVE_REPLIES.get_or_init(|| active);
    let duration = REPLY_DURATION.get_or_init(|| duration);

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(contention.clone())).ok();
    REGISTRY.register(Box::new(terminal.clone())).ok();
    REGISTRY.register(Box::new(active.clone())).ok();
    REGISTRY.register(Box::new(duration.clone())).ok();
    Ok(())
}

pub fn inc_request(agent: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[agent]).inc();
    }
}

pub fn inc_contention(reason: &str) {
    if let Some(counter) = CONTENTION_COUNTER.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

pub fn inc_terminal(progress: &str, mode: &str) {
    if let Some(counter) = TERMINAL_COUNTER.get() {
        counter.with_label_values(&[progress, mode]).inc();
    }
}

pub fn inc_active() {
    if let Some(gauge) = ACTIVE_REPLIES.get() {
        gauge.inc();
    }
}

pub fn dec_active() {
    if let Some(gauge) = ACTIVE_REPLIES.get() {
        gauge.dec();
    }
}

pub fn observe_reply_duration(seconds: f64) {
    if let Some(histogram) = REPLY_DURATION.get() {
        histogram.observe(seconds);
    }
}

/// Prometheus text exposition of everything registered.
pub fn render() -> anyhow::Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        init_metrics().unwrap();
        inc_request("normal");
        inc_contention("duplicate_request");
        inc_terminal("complete", "stream");
        let text = String::from_utf8(render().unwrap()).unwrap();
        assert!(text.contains("chat_requests_total"));
        assert!(text.contains("chat_contention_total"));
        assert!(text.contains("chat_replies_total"));
    }
}

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: String,
    pub kind: String,
    pub webhook: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub webhook: &'static str,
    pub decision: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub webhook: &'static str,
}

pub struct WebhookMetrics {
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub decisions_total: Family<DecisionLabels, Counter>,
    pub admission_request_duration_seconds: Family<WebhookLabels, Histogram>,
    pub patch_operations_total: Counter,
}

const DURATION_BUCKETS: [f64; 12] = [
    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0,
];

fn new_duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

impl WebhookMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "label_webhook_admission_requests",
            "Total number of admission requests received",
            admission_requests_total.clone(),
        );

        let decisions_total = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "label_webhook_decisions",
            "Admission decisions by outcome",
            decisions_total.clone(),
        );

        let admission_request_duration_seconds =
            Family::<WebhookLabels, Histogram>::new_with_constructor(new_duration_histogram);
        registry.register(
            "label_webhook_admission_request_duration_seconds",
            "Duration of admission request processing in seconds",
            admission_request_duration_seconds.clone(),
        );

        let patch_operations_total = Counter::default();
        registry.register(
            "label_webhook_patch_operations",
            "Total number of JSON patch operations returned by the mutating webhook",
            patch_operations_total.clone(),
        );

        Self {
            admission_requests_total,
            decisions_total,
            admission_request_duration_seconds,
            patch_operations_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_metrics_are_registered() {
        let mut registry = Registry::default();
        let metrics = WebhookMetrics::new(&mut registry);
        metrics
            .decisions_total
            .get_or_create(&DecisionLabels {
                webhook: "validate",
                decision: "denied",
            })
            .inc();
        metrics.patch_operations_total.inc_by(2);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains(r#"label_webhook_decisions_total{webhook="validate",decision="denied"} 1"#));
        assert!(buffer.contains("label_webhook_patch_operations_total 2"));
    }
}

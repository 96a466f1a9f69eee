use std::borrow::Cow;

/// A label value that is safe to export (bounded cardinality).
#[derive(Clone, Debug)]
pub struct BoundedLabel(Cow<'static, str>);

impl BoundedLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Keeps exported label sets bounded. Disconnect reasons and error
/// subsystems are compile-time strings, so passing them through is enough;
/// anything dynamic must be bucketed before it becomes a label.
#[derive(Clone, Debug, Default)]
pub struct LabelPolicy;

impl LabelPolicy {
    pub fn reason(&self, reason: &'static str) -> BoundedLabel {
        BoundedLabel(Cow::Borrowed(reason))
    }

    pub fn subsystem(&self, subsystem: &'static str) -> BoundedLabel {
        BoundedLabel(Cow::Borrowed(subsystem))
    }
}

/*
 * drwatch/api - the objects drwatchd looks at, starting with the Istio
 * DestinationRule it keeps annotated.
 */

pub mod destinationrule;
pub use destinationrule::DestinationRule;
pub use destinationrule::DestinationRuleSpec;
pub use destinationrule::Subset;
pub use destinationrule::WorkloadSelector;

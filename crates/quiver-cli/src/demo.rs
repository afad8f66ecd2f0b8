//! Valuation functions and market data for the runner.

use quiver_traits::{
    ComputedValue, ComputeFunction, FixedAvailabilityProvider, FunctionDefinition, FunctionError,
    TargetType, Value, ValueRequirement, ValueSpecification,
};

use crate::config::TargetConfig;

/// Quoted price.
pub const PRICE: &str = "Price";
/// Discount factor to the valuation date.
pub const DISCOUNT_FACTOR: &str = "DiscountFactor";
/// Price divided by discount factor.
pub const PRESENT_VALUE: &str = "PresentValue";
/// Present value change for a one basis point move.
pub const DV01: &str = "DV01";

/// `PresentValue = Price / DiscountFactor` for any security.
pub fn present_value() -> impl FunctionDefinition + 'static {
    ComputeFunction::new("PV", TargetType::Security, PRESENT_VALUE, |_, inputs| {
        let price = inputs.scalar(PRICE)?;
        let df = inputs.scalar(DISCOUNT_FACTOR)?;
        if df <= 0.0 {
            return Err(FunctionError::InvalidInput(format!(
                "discount factor must be positive, got {}",
                df
            )));
        }
        Ok(Value::Double(price / df))
    })
    .requires(PRICE)
    .requires(DISCOUNT_FACTOR)
}

/// `DV01 = PresentValue * 1bp` for bonds.
pub fn dv01() -> impl FunctionDefinition + 'static {
    ComputeFunction::new("DV01", TargetType::Bond, DV01, |_, inputs| {
        Ok(Value::Double(inputs.scalar(PRESENT_VALUE)? * 1e-4))
    })
    .requires(PRESENT_VALUE)
}

/// Prices and discount factors are supplied externally for every target.
pub fn availability(targets: &[TargetConfig]) -> FixedAvailabilityProvider {
    let mut provider = FixedAvailabilityProvider::new();
    for t in targets {
        provider.add_requirement(ValueRequirement::new(PRICE, t.target()));
        provider.add_requirement(ValueRequirement::new(DISCOUNT_FACTOR, t.target()));
    }
    provider
}

/// Requested values: PresentValue everywhere, DV01 on bonds.
pub fn requirements(targets: &[TargetConfig]) -> Vec<ValueRequirement> {
    let mut requirements = Vec::new();
    for t in targets {
        requirements.push(ValueRequirement::new(PRESENT_VALUE, t.target()));
        if TargetType::Bond.is_assignable_from(t.target_type) {
            requirements.push(ValueRequirement::new(DV01, t.target()));
        }
    }
    requirements
}

/// Market data for a cycle, with prices moved by `shift` per cycle.
pub fn market_data(targets: &[TargetConfig], shift: f64, cycle_index: u32) -> Vec<ComputedValue> {
    targets
        .iter()
        .flat_map(|t| {
            let price = ValueSpecification::external(&ValueRequirement::new(PRICE, t.target()));
            let df =
                ValueSpecification::external(&ValueRequirement::new(DISCOUNT_FACTOR, t.target()));
            [
                ComputedValue::new(price, t.price + shift * f64::from(cycle_index)),
                ComputedValue::new(df, t.discount_factor),
            ]
        })
        .collect()
}

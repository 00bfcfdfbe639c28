use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::collections::HashMap;

/// Standard VAT rates for EU member states, keyed by ISO 3166-1 alpha-2.
const EU_VAT_RATES: &[(&str, Decimal)] = &[
    ("AT", dec!(0.20)),
    ("BE", dec!(0.21)),
    ("BG", dec!(0.20)),
    ("CY", dec!(0.19)),
    ("CZ", dec!(0.21)),
    ("DE", dec!(0.19)),
    ("DK", dec!(0.25)),
    ("EE", dec!(0.22)),
    ("ES", dec!(0.21)),
    ("FI", dec!(0.255)),
    ("FR", dec!(0.20)),
    ("GR", dec!(0.24)),
    ("HR", dec!(0.25)),
    ("HU", dec!(0.27)),
    ("IE", dec!(0.23)),
    ("IT", dec!(0.22)),
    ("LT", dec!(0.21)),
    ("LU", dec!(0.17)),
    ("LV", dec!(0.21)),
    ("MT", dec!(0.18)),
    ("NL", dec!(0.21)),
    ("PL", dec!(0.23)),
    ("PT", dec!(0.23)),
    ("RO", dec!(0.21)),
    ("SE", dec!(0.25)),
    ("SI", dec!(0.22)),
    ("SK", dec!(0.23)),
];

/// Net price plus VAT, all in the same currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceBreakdown {
    pub net: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub gross: Decimal,
}

pub fn vat_rate(country_code: Option<&str>) -> Decimal {
    let Some(code) = country_code.map(|c| c.trim().to_ascii_uppercase()) else {
        return Decimal::ZERO;
    };
    EU_VAT_RATES
        .iter()
        .find(|(country, _)| *country == code)
        .map(|(_, rate)| *rate)
        .unwrap_or(Decimal::ZERO)
}

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Adds destination-country VAT on top of a net price.
pub fn apply_vat(net: Decimal, country_code: Option<&str>) -> PriceBreakdown {
    let tax_rate = vat_rate(country_code);
    let net = round_money(net);
    let tax_amount = round_money(net * tax_rate);
    PriceBreakdown {
        net,
        tax_rate,
        tax_amount,
        gross: net + tax_amount,
    }
}

/// Converts between currencies through a table of "settlement units per one
/// unit of currency". Returns `None` when either side has no rate.
pub fn convert(
    amount: Decimal,
    from: &str,
    to: &str,
    rates: &HashMap<String, Decimal>,
) -> Option<Decimal> {
    let from = from.to_ascii_uppercase();
    let to = to.to_ascii_uppercase();
    if from == to {
        return Some(round_money(amount));
    }
    let from_rate = rates.get(&from)?;
    let to_rate = rates.get(&to).filter(|r| !r.is_zero())?;
    Some(round_money(amount * from_rate / to_rate))
}

/// Major units to the integer minor units most card gateways expect.
pub fn to_minor_units(amount: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    (round_money(amount) * dec!(100)).to_i64().unwrap_or(i64::MAX)
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

//! Canonical `BASE/QUOTE` symbols and translation to exchange-native forms.
//!
//! Every exchange spells the same instrument differently: Binance and Bybit
//! concatenate (`BTCUSDT`), OKX hyphenates and tags perpetuals with a
//! `-SWAP` suffix (`BTC-USDT-SWAP`). The mapper owns those rules plus a
//! small table of historical renames (the Terra fork left `LUNA` meaning
//! different things on different venues).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;

/// Supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
}

impl Exchange {
    pub const ALL: [Exchange; 3] = [Exchange::Binance, Exchange::Bybit, Exchange::Okx];

    pub fn as_str(self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Okx => "okx",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Exchange::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ExchangeError::UnknownExchange(s.to_string()))
    }
}

/// Canonical `BASE/QUOTE` symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol {
    pub base: String,
    pub quote: String,
}

impl Symbol {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.to_uppercase(),
            quote: quote.to_uppercase(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, ExchangeError> {
        match s.split_once('/') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {
                Ok(Self::new(base, quote))
            }
            _ => Err(ExchangeError::AmbiguousSymbol(s.to_string())),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl TryFrom<String> for Symbol {
    type Error = ExchangeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Symbol::parse(&s)
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> Self {
        s.to_string()
    }
}

/// Quote assets recognised when splitting delimiter-free native symbols.
/// Longest suffix wins, so USDT is tried before USD.
const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "BTC", "ETH", "USD"];

/// `(exchange, canonical_base, native_base)` overrides for historical forks.
const FORK_RENAMES: &[(Exchange, &str, &str)] = &[
    // Post-Terra: Bybit listed the relaunched chain as LUNA2; the canonical
    // LUNA refers to the new chain, LUNC to classic.
    (Exchange::Bybit, "LUNA", "LUNA2"),
];

/// Stateless bi-directional symbol translation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolMapper;

impl SymbolMapper {
    pub fn new() -> Self {
        Self
    }

    fn native_base(symbol: &Symbol, exchange: Exchange) -> String {
        FORK_RENAMES
            .iter()
            .find(|(ex, canonical, _)| *ex == exchange && *canonical == symbol.base)
            .map_or_else(|| symbol.base.clone(), |(_, _, native)| (*native).to_string())
    }

    fn canonical_base(native: &str, exchange: Exchange) -> String {
        FORK_RENAMES
            .iter()
            .find(|(ex, _, nat)| *ex == exchange && *nat == native)
            .map_or_else(|| native.to_string(), |(_, canonical, _)| (*canonical).to_string())
    }

    /// Canonical → exchange-native (perpetual contract form).
    pub fn to_exchange(&self, symbol: &Symbol, exchange: Exchange) -> String {
        let base = Self::native_base(symbol, exchange);
        match exchange {
            Exchange::Binance | Exchange::Bybit => format!("{base}{}", symbol.quote),
            Exchange::Okx => format!("{base}-{}-SWAP", symbol.quote),
        }
    }

    /// Exchange-native → canonical. Delimiter-free forms are split by the
    /// longest known quote suffix.
    pub fn to_canonical(&self, native: &str, exchange: Exchange) -> Result<Symbol, ExchangeError> {
        let native = native.to_uppercase();
        match exchange {
            Exchange::Okx => {
                let mut parts = native.split('-');
                match (parts.next(), parts.next()) {
                    (Some(base), Some(quote)) if !base.is_empty() && !quote.is_empty() => {
                        Ok(Symbol::new(&Self::canonical_base(base, exchange), quote))
                    }
                    _ => Err(ExchangeError::AmbiguousSymbol(native.clone())),
                }
            }
            Exchange::Binance | Exchange::Bybit => {
                let quote = KNOWN_QUOTES
                    .iter()
                    .find(|q| native.ends_with(**q) && native.len() > q.len())
                    .ok_or_else(|| ExchangeError::AmbiguousSymbol(native.clone()))?;
                let base = &native[..native.len() - quote.len()];
                Ok(Symbol::new(&Self::canonical_base(base, exchange), quote))
            }
        }
    }

    /// Native spelling on every known exchange, in deterministic order.
    pub fn all_formats(&self, symbol: &Symbol) -> BTreeMap<Exchange, String> {
        Exchange::ALL
            .into_iter()
            .map(|ex| (ex, self.to_exchange(symbol, ex)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_parse_and_display() {
        let s = Symbol::parse("btc/usdt").unwrap();
        assert_eq!(s.base, "BTC");
        assert_eq!(s.quote, "USDT");
        assert_eq!(s.to_string(), "BTC/USDT");
    }

    #[test]
    fn parse_rejects_missing_delimiter() {
        assert!(Symbol::parse("BTCUSDT").is_err());
        assert!(Symbol::parse("/USDT").is_err());
        assert!(Symbol::parse("BTC/").is_err());
    }

    #[test]
    fn to_exchange_per_venue() {
        let mapper = SymbolMapper::new();
        let s = Symbol::parse("BTC/USDT").unwrap();
        assert_eq!(mapper.to_exchange(&s, Exchange::Binance), "BTCUSDT");
        assert_eq!(mapper.to_exchange(&s, Exchange::Bybit), "BTCUSDT");
        assert_eq!(mapper.to_exchange(&s, Exchange::Okx), "BTC-USDT-SWAP");
    }

    #[test]
    fn round_trip_every_exchange() {
        let mapper = SymbolMapper::new();
        for sym in ["BTC/USDT", "ETH/USDC", "SOL/USDT", "LUNA/USDT"] {
            let s = Symbol::parse(sym).unwrap();
            for ex in Exchange::ALL {
                let native = mapper.to_exchange(&s, ex);
                let back = mapper.to_canonical(&native, ex).unwrap();
                assert_eq!(back, s, "round trip failed for {sym} on {ex}");
            }
        }
    }

    #[test]
    fn longest_quote_suffix_wins() {
        let mapper = SymbolMapper::new();
        // BTCUSD must not be parsed as BTCUS/D or similar; ETHBUSD must pick
        // BUSD over USD.
        let s = mapper.to_canonical("BTCUSD", Exchange::Binance).unwrap();
        assert_eq!(s, Symbol::new("BTC", "USD"));
        let s = mapper.to_canonical("ETHBUSD", Exchange::Binance).unwrap();
        assert_eq!(s, Symbol::new("ETH", "BUSD"));
    }

    #[test]
    fn ambiguous_native_rejected() {
        let mapper = SymbolMapper::new();
        assert!(matches!(
            mapper.to_canonical("BTCXYZ", Exchange::Binance),
            Err(ExchangeError::AmbiguousSymbol(_))
        ));
        // A bare quote with no base is ambiguous, not BASE="".
        assert!(mapper.to_canonical("USDT", Exchange::Binance).is_err());
    }

    #[test]
    fn fork_rename_applied_on_bybit_only() {
        let mapper = SymbolMapper::new();
        let luna = Symbol::parse("LUNA/USDT").unwrap();
        assert_eq!(mapper.to_exchange(&luna, Exchange::Bybit), "LUNA2USDT");
        assert_eq!(mapper.to_exchange(&luna, Exchange::Binance), "LUNAUSDT");
        let back = mapper.to_canonical("LUNA2USDT", Exchange::Bybit).unwrap();
        assert_eq!(back, luna);
    }

    #[test]
    fn all_formats_lists_every_exchange() {
        let mapper = SymbolMapper::new();
        let s = Symbol::parse("ETH/USDT").unwrap();
        let formats = mapper.all_formats(&s);
        assert_eq!(formats.len(), Exchange::ALL.len());
        assert_eq!(formats[&Exchange::Okx], "ETH-USDT-SWAP");
    }

    #[test]
    fn exchange_from_str() {
        assert_eq!("Binance".parse::<Exchange>().unwrap(), Exchange::Binance);
        assert!(matches!(
            "kraken".parse::<Exchange>(),
            Err(ExchangeError::UnknownExchange(_))
        ));
    }
}

use crate::error::DataError;
use derive_more::{Display, From};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Opaque upstream identifier for a tradable instrument
/// (eg/ `"NSE_EQ|INE009A01021"`).
///
/// Stable for the process lifetime and mapped 1:1 to a human symbol by the
/// [`InstrumentDirectory`].
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct InstrumentKey(pub SmolStr);

impl InstrumentKey {
    pub fn new<S>(key: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(key.into())
    }
}

impl AsRef<str> for InstrumentKey {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl From<&str> for InstrumentKey {
    fn from(value: &str) -> Self {
        Self(SmolStr::new(value))
    }
}

/// Upstream market session state attached to every [`Tick`](crate::event::Tick).
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketStatus {
    #[display("OPEN")]
    Open,
    #[default]
    #[display("CLOSED")]
    Closed,
    #[display("ERROR")]
    Error,
}

/// A watched instrument: human symbol plus its upstream key.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct Instrument {
    pub symbol: SmolStr,
    pub key: InstrumentKey,
}

impl Instrument {
    pub fn new<S>(symbol: S, key: InstrumentKey) -> Self
    where
        S: Into<SmolStr>,
    {
        Self {
            symbol: symbol.into(),
            key,
        }
    }
}

/// One record of the upstream instrument master contract.
#[derive(Clone, Debug, Deserialize)]
pub struct InstrumentRecord {
    #[serde(rename = "tradingsymbol")]
    pub symbol: String,
    pub instrument_key: String,
    #[serde(default)]
    pub name: String,
}

/// Symbol -> [`InstrumentKey`] lookup, loaded once at startup from the broker
/// instrument master and queried by symbol (case-insensitive).
#[derive(Clone, Debug, Default)]
pub struct InstrumentDirectory {
    entries: IndexMap<SmolStr, InstrumentKey>,
}

impl InstrumentDirectory {
    /// Build a directory from instrument master records, keeping the first
    /// entry when a symbol appears more than once.
    pub fn new<Iter>(records: Iter) -> Self
    where
        Iter: IntoIterator<Item = InstrumentRecord>,
    {
        let entries = records
            .into_iter()
            .map(|record| {
                (
                    SmolStr::new(record.symbol.to_uppercase()),
                    InstrumentKey::new(record.instrument_key),
                )
            })
            .collect();

        Self { entries }
    }

    /// Parse a directory from the broker instrument master JSON array.
    pub fn from_json(json: &str) -> Result<Self, DataError> {
        let records: Vec<InstrumentRecord> = serde_json::from_str(json)?;
        Ok(Self::new(records))
    }

    /// Find the [`InstrumentKey`] for a human symbol.
    pub fn key(&self, symbol: &str) -> Option<&InstrumentKey> {
        self.entries.get(symbol.to_uppercase().as_str())
    }

    /// Find the key for a symbol, surfacing a typed failure for unknown
    /// symbols so callers can skip the instrument rather than crash.
    pub fn key_or_err(&self, symbol: &str) -> Result<InstrumentKey, DataError> {
        self.key(symbol)
            .cloned()
            .ok_or_else(|| DataError::InstrumentNotFound(symbol.to_string()))
    }

    /// Resolve a watchlist of symbols into [`Instrument`]s, logging and
    /// skipping symbols missing from the directory.
    pub fn resolve<'a, Iter>(&self, symbols: Iter) -> Vec<Instrument>
    where
        Iter: IntoIterator<Item = &'a str>,
    {
        symbols
            .into_iter()
            .filter_map(|symbol| match self.key(symbol) {
                Some(key) => Some(Instrument::new(symbol.to_uppercase(), key.clone())),
                None => {
                    tracing::warn!(%symbol, "symbol missing from instrument directory - skipping");
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> InstrumentDirectory {
        InstrumentDirectory::from_json(
            r#"
            [
                {"tradingsymbol": "RELIANCE", "instrument_key": "NSE_EQ|INE002A01018", "name": "Reliance Industries"},
                {"tradingsymbol": "TCS", "instrument_key": "NSE_EQ|INE467B01029", "name": "Tata Consultancy Services"}
            ]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_directory_lookup_is_case_insensitive() {
        let directory = directory();
        assert_eq!(
            directory.key("reliance"),
            Some(&InstrumentKey::from("NSE_EQ|INE002A01018"))
        );
        assert_eq!(
            directory.key("Tcs"),
            Some(&InstrumentKey::from("NSE_EQ|INE467B01029"))
        );
    }

    #[test]
    fn test_unknown_symbol_is_typed_failure() {
        let directory = directory();
        assert!(matches!(
            directory.key_or_err("WIPRO"),
            Err(DataError::InstrumentNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_skips_unknown_symbols() {
        let directory = directory();
        let instruments = directory.resolve(["RELIANCE", "WIPRO", "TCS"]);
        assert_eq!(instruments.len(), 2);
        assert_eq!(instruments[0].symbol, "RELIANCE");
        assert_eq!(instruments[1].symbol, "TCS");
    }
}

//! The `random` namespace: test-data generation.
//!
//! A configured seed replays the exact same data. Without a seed the
//! generator is seeded from the OS.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::provider::{CallArgs, ProviderError, ServiceProvider};
use crate::value::Value;

const METHODS: [&str; 9] = ["int", "float", "bool", "uuid", "string", "email", "name", "pick", "shuffle"];

/// Longest string `random.string` will build.
pub const MAX_STRING_LENGTH: i64 = 1_000_000;

const FIRST_NAMES: [&str; 12] = [
    "Alice", "Bruno", "Chen", "Dana", "Emeka", "Farah", "Goran", "Hana", "Ivan", "Jamal", "Kira", "Lena",
];
const LAST_NAMES: [&str; 10] = [
    "Ahmed", "Baker", "Costa", "Dubois", "Eriksen", "Fischer", "Garcia", "Haddad", "Ito", "Jensen",
];

pub struct RandomProvider {
    rng: Mutex<StdRng>,
}

impl RandomProvider {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng: Mutex::new(rng) }
    }

    fn list_arg(args: &CallArgs) -> Result<Vec<Value>, ProviderError> {
        match args.get(0, "items") {
            Some(Value::List(items)) => Ok(items.clone()),
            Some(other) => Err(ProviderError::InvalidArguments(format!(
                "expected a list, got {}",
                other.type_name()
            ))),
            None => Err(ProviderError::InvalidArguments("missing argument 'items'".to_string())),
        }
    }
}

fn pick_name<'a>(rng: &mut StdRng, names: &[&'a str]) -> &'a str {
    names.choose(rng).copied().unwrap_or_default()
}

#[async_trait]
impl ServiceProvider for RandomProvider {
    fn namespace(&self) -> &str {
        "random"
    }

    fn methods(&self) -> Vec<String> {
        METHODS.iter().map(|m| m.to_string()).collect()
    }

    async fn invoke(&self, method: &str, args: CallArgs) -> Result<Value, ProviderError> {
        let mut rng = self.rng.lock().await;
        let rng = &mut *rng;
        match method {
            "int" => {
                let min = args.optional_i64(0, "min")?.unwrap_or(0);
                let max = args.optional_i64(1, "max")?.unwrap_or(100);
                if min > max {
                    return Err(ProviderError::InvalidArguments(format!("min {} is greater than max {}", min, max)));
                }
                Ok(Value::Integer(rng.gen_range(min..=max)))
            }
            "float" => {
                let min = args.get(0, "min").and_then(Value::as_f64).unwrap_or(0.0);
                let max = args.get(1, "max").and_then(Value::as_f64).unwrap_or(1.0);
                if !(max - min).is_finite() {
                    return Err(ProviderError::InvalidArguments(format!("invalid range {}..{}", min, max)));
                }
                if min > max {
                    return Err(ProviderError::InvalidArguments(format!("min {} is greater than max {}", min, max)));
                }
                if min == max {
                    return Ok(Value::Float(min));
                }
                Ok(Value::Float(rng.gen_range(min..max)))
            }
            "bool" => Ok(Value::Bool(rng.gen())),
            "uuid" => {
                let bytes: [u8; 16] = rng.gen();
                Ok(Value::String(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()))
            }
            "string" => {
                let len = args.optional_i64(0, "length")?.unwrap_or(8);
                if len < 0 {
                    return Err(ProviderError::InvalidArguments("length must not be negative".to_string()));
                }
                if len > MAX_STRING_LENGTH {
                    return Err(ProviderError::InvalidArguments(format!(
                        "length {} exceeds the limit of {}",
                        len, MAX_STRING_LENGTH
                    )));
                }
                let out: String = (&mut *rng)
                    .sample_iter(&Alphanumeric)
                    .take(len as usize)
                    .map(char::from)
                    .collect();
                Ok(Value::String(out))
            }
            "name" => {
                let first = pick_name(rng, &FIRST_NAMES);
                let last = pick_name(rng, &LAST_NAMES);
                Ok(Value::String(format!("{} {}", first, last)))
            }
            "email" => {
                let first = pick_name(rng, &FIRST_NAMES);
                let n: u32 = rng.gen_range(0..10_000);
                let domain = match args.get(0, "domain") {
                    Some(Value::String(d)) => d.clone(),
                    _ => "example.com".to_string(),
                };
                Ok(Value::String(format!("{}{}@{}", first.to_lowercase(), n, domain)))
            }
            "pick" => {
                let items = Self::list_arg(&args)?;
                items
                    .choose(rng)
                    .cloned()
                    .ok_or_else(|| ProviderError::InvalidArguments("cannot pick from an empty list".to_string()))
            }
            "shuffle" => {
                let mut items = Self::list_arg(&args)?;
                items.shuffle(rng);
                Ok(Value::List(items))
            }
            _ => Err(ProviderError::NotSupported {
                namespace: "random".to_string(),
                method: method.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_provider_is_deterministic() {
        let a = RandomProvider::new(Some(7));
        let b = RandomProvider::new(Some(7));
        for method in ["int", "uuid", "name", "email", "string"] {
            let x = a.invoke(method, CallArgs::default()).await.unwrap();
            let y = b.invoke(method, CallArgs::default()).await.unwrap();
            assert_eq!(x, y, "{} should replay with the same seed", method);
        }
    }

    #[tokio::test]
    async fn test_int_respects_bounds() {
        let random = RandomProvider::new(Some(1));
        for _ in 0..200 {
            let args = CallArgs::positional(vec![Value::Integer(-3), Value::Integer(3)]);
            match random.invoke("int", args).await.unwrap() {
                Value::Integer(n) => assert!((-3..=3).contains(&n)),
                other => panic!("Expected Integer, got {:?}", other),
            }
        }
        let bad = CallArgs::positional(vec![Value::Integer(5), Value::Integer(1)]);
        assert!(random.invoke("int", bad).await.is_err());
    }

    #[tokio::test]
    async fn test_uuid_is_v4() {
        let random = RandomProvider::new(Some(99));
        let value = random.invoke("uuid", CallArgs::default()).await.unwrap();
        let parsed = uuid::Uuid::parse_str(value.as_str().unwrap()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[tokio::test]
    async fn test_string_length() {
        let random = RandomProvider::new(Some(3));
        let value = random
            .invoke("string", CallArgs::positional(vec![Value::Integer(12)]))
            .await
            .unwrap();
        assert_eq!(value.as_str().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_shuffle_keeps_elements() {
        let random = RandomProvider::new(Some(5));
        let list = Value::from(vec![1i64, 2, 3, 4, 5]);
        let shuffled = random
            .invoke("shuffle", CallArgs::positional(vec![list]))
            .await
            .unwrap();
        match shuffled {
            Value::List(mut items) => {
                items.sort_by_key(|v| v.as_i64());
                assert_eq!(Value::List(items), Value::from(vec![1i64, 2, 3, 4, 5]));
            }
            other => panic!("Expected List, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pick_from_empty_list_fails() {
        let random = RandomProvider::new(Some(5));
        let err = random
            .invoke("pick", CallArgs::positional(vec![Value::List(vec![])]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_string_length_is_capped() {
        let random = RandomProvider::new(Some(3));
        let err = random
            .invoke("string", CallArgs::positional(vec![Value::Integer(1 << 62)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidArguments(msg) if msg.contains("exceeds")));

        let at_limit = random
            .invoke("string", CallArgs::positional(vec![Value::Integer(MAX_STRING_LENGTH)]))
            .await
            .unwrap();
        assert_eq!(at_limit.as_str().unwrap().len(), MAX_STRING_LENGTH as usize);
    }

    #[tokio::test]
    async fn test_different_seeds_diverge() {
        let a = RandomProvider::new(Some(1));
        let b = RandomProvider::new(Some(2));
        let args = || CallArgs::positional(vec![Value::Integer(32)]);
        assert_ne!(
            a.invoke("string", args()).await.unwrap(),
            b.invoke("string", args()).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_float_range() {
        let random = RandomProvider::new(Some(4));
        for _ in 0..100 {
            let args = CallArgs::positional(vec![Value::Float(2.0), Value::Float(2.5)]);
            let n = random.invoke("float", args).await.unwrap().as_f64().unwrap();
            assert!((2.0..2.5).contains(&n));
        }
        let same = CallArgs::positional(vec![Value::Float(1.5), Value::Float(1.5)]);
        assert_eq!(random.invoke("float", same).await.unwrap(), Value::Float(1.5));
    }
}

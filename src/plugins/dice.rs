// ABOUTME: Dice plugin: `!roll NdM[+K]` with configurable limits
// ABOUTME: Defaults to a single six-sided die when no expression is given

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chirp_core::{handler_fn, CommandDescriptor, Plugin, PluginContext, SettingsHandle};
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const MAX_MODIFIER: i64 = 1_000_000;

#[derive(Debug, Clone, Deserialize)]
pub struct DiceSettings {
    pub max_dice: u32,
    pub max_sides: u32,
    pub cooldown_secs: u64,
}

/// A parsed dice expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiceRoll {
    pub count: u32,
    pub sides: u32,
    pub modifier: i64,
}

impl DiceRoll {
    pub fn roll<R: Rng>(&self, rng: &mut R) -> (Vec<u32>, i64) {
        let faces: Vec<u32> = (0..self.count).map(|_| rng.gen_range(1..=self.sides)).collect();
        let total = faces
            .iter()
            .fold(self.modifier, |acc, &f| acc.saturating_add(i64::from(f)));
        (faces, total)
    }

    fn label(&self) -> String {
        match self.modifier {
            0 => format!("{}d{}", self.count, self.sides),
            m if m > 0 => format!("{}d{}+{}", self.count, self.sides, m),
            m => format!("{}d{}{}", self.count, self.sides, m),
        }
    }
}

pub struct DiceParser {
    pattern: Regex,
}

impl DiceParser {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(r"^(\d*)[dD](\d+)(?:([+-])(\d+))?$").context("Invalid dice pattern")?;
        Ok(Self { pattern })
    }

    pub fn parse(&self, expr: &str, limits: &DiceSettings) -> Result<DiceRoll> {
        let caps = self
            .pattern
            .captures(expr.trim())
            .with_context(|| format!("'{}' is not a dice expression", expr))?;

        let count = match caps.get(1).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
            Some(n) => n.parse::<u32>().context("dice count too large")?,
            None => 1,
        };
        let sides = caps[2].parse::<u32>().context("too many sides")?;
        let modifier = match (caps.get(3), caps.get(4)) {
            (Some(sign), Some(value)) => {
                let value = value.as_str().parse::<i64>().context("modifier too large")?;
                if sign.as_str() == "-" {
                    -value
                } else {
                    value
                }
            }
            _ => 0,
        };
        if modifier.abs() > MAX_MODIFIER {
            bail!("modifier must be between -{0} and {0}", MAX_MODIFIER);
        }

        if count == 0 || count > limits.max_dice {
            bail!("roll between 1 and {} dice", limits.max_dice);
        }
        if sides < 2 || sides > limits.max_sides {
            bail!("dice need between 2 and {} sides", limits.max_sides);
        }
        Ok(DiceRoll { count, sides, modifier })
    }
}

fn format_roll(user: &str, roll: &DiceRoll, faces: &[u32], total: i64) -> String {
    if faces.len() == 1 && roll.modifier == 0 {
        return format!("@{} rolled {}: {}", user, roll.label(), total);
    }
    let mut parts: Vec<String> = faces.iter().map(u32::to_string).collect();
    if roll.modifier != 0 {
        parts.push(format!("({:+})", roll.modifier));
    }
    format!("@{} rolled {}: {} = {}", user, roll.label(), parts.join(" + "), total)
}

pub struct DicePlugin {
    parser: Arc<DiceParser>,
    settings: Option<SettingsHandle>,
}

impl DicePlugin {
    pub fn new() -> Result<Self> {
        Ok(Self {
            parser: Arc::new(DiceParser::new()?),
            settings: None,
        })
    }
}

#[async_trait]
impl Plugin for DicePlugin {
    fn name(&self) -> &str {
        "dice"
    }

    fn description(&self) -> &str {
        "Roll dice with !roll NdM+K"
    }

    fn default_settings(&self) -> Value {
        json!({"max_dice": 20, "max_sides": 1000, "cooldown_secs": 0})
    }

    async fn init(&mut self, ctx: PluginContext) -> Result<bool> {
        let settings: DiceSettings = ctx.settings.get_as().context("Invalid dice settings")?;
        tracing::debug!(max_dice = settings.max_dice, max_sides = settings.max_sides, "Dice ready");
        self.settings = Some(ctx.settings);
        Ok(true)
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        let Some(settings) = self.settings.clone() else {
            return Vec::new();
        };
        let cooldown = settings.get_as::<DiceSettings>().map(|s| s.cooldown_secs).unwrap_or(0);
        let parser = Arc::clone(&self.parser);

        vec![CommandDescriptor::new(
            "roll",
            handler_fn(move |ctx| {
                let limits: DiceSettings = settings.get_as()?;
                let expr = ctx.command.first_arg().unwrap_or("1d6").to_string();
                let user = ctx.user.display().to_string();
                match parser.parse(&expr, &limits) {
                    Ok(roll) => {
                        let (faces, total) = roll.roll(&mut rand::thread_rng());
                        ctx.reply(format_roll(&user, &roll, &faces, total));
                    }
                    Err(e) => ctx.reply(format!("@{} {}", user, e)),
                }
                Ok(true)
            }),
        )
        .alias("dice")
        .cooldown_secs(cooldown)
        .description("Roll dice, e.g. !roll 2d6+1")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn limits() -> DiceSettings {
        DiceSettings {
            max_dice: 20,
            max_sides: 1000,
            cooldown_secs: 0,
        }
    }

    #[test]
    fn test_parse_expressions() {
        let parser = DiceParser::new().unwrap();
        assert_eq!(
            parser.parse("2d6", &limits()).unwrap(),
            DiceRoll { count: 2, sides: 6, modifier: 0 }
        );
        assert_eq!(
            parser.parse("d20", &limits()).unwrap(),
            DiceRoll { count: 1, sides: 20, modifier: 0 }
        );
        assert_eq!(
            parser.parse("3D8-2", &limits()).unwrap(),
            DiceRoll { count: 3, sides: 8, modifier: -2 }
        );
        assert_eq!(parser.parse("1d4+10", &limits()).unwrap().modifier, 10);
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        let parser = DiceParser::new().unwrap();
        assert!(parser.parse("21d6", &limits()).is_err());
        assert!(parser.parse("0d6", &limits()).is_err());
        assert!(parser.parse("1d1", &limits()).is_err());
        assert!(parser.parse("1d5000", &limits()).is_err());
        assert!(parser.parse("banana", &limits()).is_err());
        assert!(parser.parse("99999999999d6", &limits()).is_err());
    }

    #[test]
    fn test_parse_rejects_huge_modifier() {
        let parser = DiceParser::new().unwrap();
        assert!(parser.parse("1d6+1000000", &limits()).is_ok());
        assert!(parser.parse("1d6-1000000", &limits()).is_ok());
        let err = parser.parse("1d6+9223372036854775807", &limits()).unwrap_err();
        assert!(err.to_string().contains("modifier"));
        assert!(parser.parse("1d6-1000001", &limits()).is_err());
    }

    #[test]
    fn test_roll_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let roll = DiceRoll { count: 5, sides: 6, modifier: 3 };
        for _ in 0..100 {
            let (faces, total) = roll.roll(&mut rng);
            assert_eq!(faces.len(), 5);
            assert!(faces.iter().all(|&f| (1..=6).contains(&f)));
            assert!((8..=33).contains(&total));
        }
    }

    #[test]
    fn test_format_roll() {
        let roll = DiceRoll { count: 2, sides: 6, modifier: 1 };
        assert_eq!(format_roll("alice", &roll, &[3, 4], 8), "@alice rolled 2d6+1: 3 + 4 + (+1) = 8");
        let single = DiceRoll { count: 1, sides: 20, modifier: 0 };
        assert_eq!(format_roll("bob", &single, &[17], 17), "@bob rolled 1d20: 17");
    }
}

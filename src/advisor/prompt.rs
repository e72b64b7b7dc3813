// =============================================================================
// Advisory prompt assembly and response parsing
// =============================================================================

use tracing::trace;

use crate::advisor::{CashStance, MarketBrief};
use crate::types::Action;

/// Render the full prompt for one pair, including the portfolio-awareness
/// block and the regime context.
pub fn render(brief: &MarketBrief) -> String {
    let p = &brief.portfolio;

    let stance_instruction = match p.stance() {
        CashStance::CriticalLow => format!(
            "Cash is CRITICALLY LOW ({:.1}% < {:.1}%). Prefer SELL. \
             Only recommend BUY with confidence above 85.",
            p.quote_pct, p.critical_low_pct
        ),
        CashStance::Low => format!(
            "Cash is below target ({:.1}% < {:.1}%). Prefer SELL over BUY.",
            p.quote_pct, p.low_pct
        ),
        CashStance::Balanced => format!(
            "Cash allocation is balanced at {:.1}% (target {:.1}%).",
            p.quote_pct, p.target_pct
        ),
        CashStance::High => format!(
            "Cash is above the high watermark ({:.1}% > {:.1}%). Prefer BUY.",
            p.quote_pct, p.high_pct
        ),
    };

    let bear_instruction = if p.hard_bear {
        "\nThe market is in a hard bear phase (7-day drop beyond -5%). \
         Require confidence of at least 85 for any BUY."
    } else {
        ""
    };

    let prompt = format!(
        r#"You are the advisory analyst of an automated crypto trading agent.

Market summary for {pair}:
- Price: {price:.2} {quote}
- RSI(14): {rsi:.1}
- MACD histogram: {macd:.4}
- Price change 24h: {c24:.2}%
- Price change 7d: {c7:.2}%
- Price change 30d: {c30:.2}%
- Detected regime: {regime}

Portfolio awareness:
- {quote} balance: {balance:.2} ({pct:.1}% of portfolio, target {target:.1}%)
- Thresholds: critical-low {crit:.1}%, low {low:.1}%, high {high:.1}%
- {stance}{bear}

Answer with a single JSON object and nothing else:
{{"action": "BUY"|"SELL"|"HOLD", "confidence": 0-100, "reasoning": "<one sentence>"}}"#,
        pair = brief.pair,
        price = brief.price,
        quote = p.quote_currency,
        rsi = brief.rsi,
        macd = brief.macd_histogram,
        c24 = brief.price_change_24h,
        c7 = brief.price_change_7d,
        c30 = brief.price_change_30d,
        regime = brief.regime,
        balance = p.quote_balance,
        pct = p.quote_pct,
        target = p.target_pct,
        crit = p.critical_low_pct,
        low = p.low_pct,
        high = p.high_pct,
        stance = stance_instruction,
        bear = bear_instruction,
    );

    trace!(chars = prompt.len(), "advisory prompt rendered");
    prompt
}

/// Extract `{action, confidence, reasoning}` from a model response.
///
/// Models tend to wrap the JSON object in prose or code fences; the first
/// balanced `{...}` span is taken. Returns `None` on empty, malformed or
/// out-of-contract responses — the caller degrades to safe-HOLD.
pub fn parse_verdict(text: &str) -> Option<(Action, f64, String)> {
    let json_span = extract_json_object(text)?;
    let value: serde_json::Value = serde_json::from_str(json_span).ok()?;

    let action = match value["action"].as_str()?.to_uppercase().as_str() {
        "BUY" => Action::Buy,
        "SELL" => Action::Sell,
        "HOLD" => Action::Hold,
        _ => return None,
    };

    let confidence = value["confidence"].as_f64()?;
    if !(0.0..=100.0).contains(&confidence) {
        return None;
    }

    let reasoning = value["reasoning"]
        .as_str()
        .unwrap_or("no reasoning given")
        .to_string();

    Some((action, confidence, reasoning))
}

/// First balanced top-level `{...}` span in `text`.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::PortfolioAwareness;
    use crate::strategy::regime::MarketRegime;
    use crate::types::Pair;

    fn brief(quote_pct: f64, hard_bear: bool) -> MarketBrief {
        MarketBrief {
            pair: Pair::parse("BTC-EUR").unwrap(),
            price: 40_000.0,
            rsi: 55.0,
            macd_histogram: 12.5,
            price_change_24h: 1.2,
            price_change_7d: -0.5,
            price_change_30d: 4.0,
            regime: MarketRegime::Bull,
            portfolio: PortfolioAwareness {
                quote_currency: "EUR".into(),
                quote_balance: quote_pct * 10.0,
                quote_pct,
                target_pct: 30.0,
                critical_low_pct: 18.0,
                low_pct: 30.0,
                high_pct: 45.0,
                hard_bear,
            },
        }
    }

    #[test]
    fn prompt_contains_portfolio_block() {
        let text = render(&brief(30.0, false));
        assert!(text.contains("BTC-EUR"));
        assert!(text.contains("critical-low 18.0%"));
        assert!(text.contains("target 30.0%"));
        assert!(text.contains("BULL"));
    }

    #[test]
    fn critical_low_demands_high_buy_conviction() {
        let text = render(&brief(10.0, false));
        assert!(text.contains("CRITICALLY LOW"));
        assert!(text.contains("above 85"));
    }

    #[test]
    fn low_cash_prefers_sell() {
        let text = render(&brief(25.0, false));
        assert!(text.contains("Prefer SELL over BUY"));
    }

    #[test]
    fn high_cash_prefers_buy() {
        let text = render(&brief(60.0, false));
        assert!(text.contains("Prefer BUY"));
    }

    #[test]
    fn hard_bear_adds_buy_gate() {
        let text = render(&brief(35.0, true));
        assert!(text.contains("hard bear"));
        assert!(text.contains("at least 85"));
    }

    #[test]
    fn parse_clean_json() {
        let (action, confidence, reasoning) =
            parse_verdict(r#"{"action": "BUY", "confidence": 72, "reasoning": "breakout"}"#)
                .unwrap();
        assert_eq!(action, Action::Buy);
        assert_eq!(confidence, 72.0);
        assert_eq!(reasoning, "breakout");
    }

    #[test]
    fn parse_json_wrapped_in_prose() {
        let text = "Sure! Here is my analysis:\n```json\n{\"action\": \"sell\", \
                    \"confidence\": 64.5, \"reasoning\": \"trend broken\"}\n``` hope it helps";
        let (action, confidence, _) = parse_verdict(text).unwrap();
        assert_eq!(action, Action::Sell);
        assert_eq!(confidence, 64.5);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_verdict("").is_none());
        assert!(parse_verdict("no json here").is_none());
        assert!(parse_verdict("{\"action\": \"YOLO\", \"confidence\": 50}").is_none());
        assert!(parse_verdict("{\"action\": \"BUY\", \"confidence\": 150}").is_none());
        assert!(parse_verdict("{\"action\": \"BUY\"}").is_none());
    }

    #[test]
    fn parse_handles_nested_braces_in_strings() {
        let text = r#"{"action": "HOLD", "confidence": 10, "reasoning": "ranges {a} and {b}"}"#;
        let (action, _, reasoning) = parse_verdict(text).unwrap();
        assert_eq!(action, Action::Hold);
        assert!(reasoning.contains("{a}"));
    }
}

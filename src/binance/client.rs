// =============================================================================
// Binance USDⓈ-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers.
//
// Error mapping:
//   429 / 418            -> RateLimited (and the tracker pauses requests)
//   5xx, timeouts        -> Transient
//   4xx {code: -2011}    -> NotFound (unknown order, e.g. already filled)
//   other 4xx {code,msg} -> Rejected
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use super::rate_limit::RateLimitTracker;
use crate::error::ExchangeError;
use crate::exchange::{Exchange, SymbolRules};
use crate::types::{ExchangePosition, OpenOrder, OrderHandle, OrderKind, OrderRequest, OrderSide, Side};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const LIVE_BASE_URL: &str = "https://fapi.binance.com";
const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";

/// Unknown order sent.
const CODE_UNKNOWN_ORDER: i64 = -2011;
/// Order does not exist.
const CODE_NO_SUCH_ORDER: i64 = -2013;

pub struct BinanceClient {
    /// `None` for public-only clients.
    secret: Option<String>,
    base_url: String,
    client: reqwest::Client,
    rate_limit: RateLimitTracker,
    rules_cache: RwLock<HashMap<String, SymbolRules>>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Signed client able to trade.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Result<Self> {
        let api_key = api_key.into();
        let mut default_headers = HeaderMap::new();
        let val = HeaderValue::from_str(&api_key).context("API key is not a valid header value")?;
        default_headers.insert("X-MBX-APIKEY", val);

        let mut client = Self::build(default_headers, testnet)?;
        client.secret = Some(secret.into());
        Ok(client)
    }

    /// Client limited to public market-data endpoints (prices, precision).
    pub fn public(testnet: bool) -> Result<Self> {
        Self::build(HeaderMap::new(), testnet)
    }

    fn build(default_headers: HeaderMap, testnet: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;
        let base_url = if testnet { TESTNET_BASE_URL } else { LIVE_BASE_URL };
        debug!(base_url, "BinanceClient initialised");
        Ok(Self {
            secret: None,
            base_url: base_url.to_string(),
            client,
            rate_limit: RateLimitTracker::new(),
            rules_cache: RwLock::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn signed_query(&self, params: &str) -> Result<String, ExchangeError> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| ExchangeError::Unsupported("signed endpoint needs API credentials".into()))?;
        let ts = Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = sign(secret, &base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
        weight: u32,
    ) -> Result<Value, ExchangeError> {
        self.rate_limit.check_request(weight)?;

        let params = encode_params(params);
        let qs = if signed { self.signed_query(&params)? } else { params };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = self.client.request(method.clone(), &url).send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        self.rate_limit.update_from_headers(&headers);

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            self.rate_limit.record_throttle(&headers);
            return Err(ExchangeError::RateLimited(format!("{method} {path} returned {status}")));
        }

        let text = resp.text().await?;
        if !status.is_success() {
            let err = map_api_error(status, &text);
            debug!(%method, path, %status, error = %err, "binance request failed");
            return Err(err);
        }
        serde_json::from_str(&text).map_err(|e| ExchangeError::Decode(format!("{path}: {e}")))
    }

    async fn load_rules(&self) -> Result<(), ExchangeError> {
        let body = self
            .request(Method::GET, "/fapi/v1/exchangeInfo", &[], false, 1)
            .await?;
        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("exchangeInfo missing 'symbols'".into()))?;

        let mut parsed = HashMap::with_capacity(symbols.len());
        for s in symbols {
            let Some(name) = s["symbol"].as_str() else { continue };
            match parse_rules(s) {
                Ok(r) => {
                    parsed.insert(name.to_string(), r);
                }
                Err(e) => debug!(symbol = name, error = %e, "skipping symbol without usable filters"),
            }
        }
        info!(count = parsed.len(), "symbol precision rules cached");
        self.rules_cache.write().extend(parsed);
        Ok(())
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    #[instrument(skip(self), name = "binance::create_order")]
    async fn create_order(&self, req: &OrderRequest) -> Result<OrderHandle, ExchangeError> {
        self.rate_limit.check_order()?;
        let rules = self.symbol_rules(&req.symbol).await?;
        let params = order_params(req, &rules);

        let body = self.request(Method::POST, "/fapi/v1/order", &params, true, 1).await?;
        let order_id = id_string(&body["orderId"])
            .ok_or_else(|| ExchangeError::Decode("order response missing 'orderId'".into()))?;
        let client_id = body["clientOrderId"]
            .as_str()
            .unwrap_or(&req.client_id)
            .to_string();

        debug!(symbol = %req.symbol, kind = ?req.kind, side = %req.side.as_str(), %order_id, "order accepted");
        Ok(OrderHandle { order_id, client_id })
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        self.request(Method::DELETE, "/fapi/v1/order", &params, true, 1).await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "binance::fetch_open_orders")]
    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let body = self.request(Method::GET, "/fapi/v1/openOrders", &params, true, 1).await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("openOrders response is not an array".into()))?;
        raw.iter().map(parse_open_order).collect()
    }

    #[instrument(skip(self), name = "binance::fetch_positions")]
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let body = self.request(Method::GET, "/fapi/v2/positionRisk", &[], true, 5).await?;
        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("positionRisk response is not an array".into()))?;
        let mut out = Vec::new();
        for p in raw {
            if let Some(pos) = parse_position(p)? {
                out.push(pos);
            }
        }
        Ok(out)
    }

    #[instrument(skip(self), name = "binance::last_price")]
    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let body = self
            .request(Method::GET, "/fapi/v1/ticker/price", &params, false, 1)
            .await?;
        num(&body, "price")
    }

    #[instrument(skip(self), name = "binance::symbol_rules")]
    async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        if let Some(r) = self.rules_cache.read().get(symbol) {
            return Ok(*r);
        }
        self.load_rules().await?;
        self.rules_cache
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::NotFound(format!("symbol {symbol} not listed")))
    }

    #[instrument(skip(self), name = "binance::available_balance")]
    async fn available_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let body = self.request(Method::GET, "/fapi/v2/balance", &[], true, 5).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("balance response is not an array".into()))?;
        match rows.iter().find(|b| b["asset"].as_str() == Some(asset)) {
            Some(b) => num(b, "availableBalance"),
            None => {
                warn!(asset, "asset not found in balances; returning 0.0");
                Ok(0.0)
            }
        }
    }

    #[instrument(skip(self), name = "binance::configure_symbol")]
    async fn configure_symbol(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("leverage", leverage.to_string())];
        self.request(Method::POST, "/fapi/v1/leverage", &params, true, 1).await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("signed", &self.secret.is_some())
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Wire helpers
// -----------------------------------------------------------------------------

/// HMAC-SHA256 hex signature of `query`.
fn sign(secret: &str, query: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Unsupported(format!("invalid signing key: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Query parameters for `POST /fapi/v1/order`, formatted to the symbol's
/// precision.
fn order_params(req: &OrderRequest, rules: &SymbolRules) -> Vec<(&'static str, String)> {
    let mut p = vec![
        ("symbol", req.symbol.clone()),
        ("side", req.side.as_str().to_string()),
        ("type", req.kind.as_exchange_str().to_string()),
    ];
    if let Some(ps) = req.position_side {
        p.push(("positionSide", ps.as_position_side().to_string()));
    }
    match req.quantity {
        Some(q) => {
            p.push(("quantity", format!("{:.*}", rules.quantity_decimals() as usize, q)));
            // Hedge-mode orders are closing by virtue of positionSide; the
            // exchange rejects reduceOnly alongside it.
            if req.reduce_only && req.position_side.is_none() {
                p.push(("reduceOnly", "true".into()));
            }
        }
        None => p.push(("closePosition", "true".into())),
    }
    if let Some(t) = req.trigger_price {
        p.push(("stopPrice", format!("{:.*}", rules.price_decimals() as usize, t)));
        p.push(("workingType", "MARK_PRICE".into()));
    }
    p.push(("newClientOrderId", req.client_id.clone()));
    p
}

fn map_api_error(status: StatusCode, body: &str) -> ExchangeError {
    if status.is_server_error() {
        return ExchangeError::Transient(format!("{status}: {body}"));
    }
    let parsed: Option<(i64, String)> = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        Some((v["code"].as_i64()?, v["msg"].as_str().unwrap_or_default().to_string()))
    });
    match parsed {
        Some((code, msg)) if code == CODE_UNKNOWN_ORDER || code == CODE_NO_SUCH_ORDER => ExchangeError::NotFound(msg),
        Some((code, msg)) => ExchangeError::Rejected { code, msg },
        None => ExchangeError::Rejected {
            code: i64::from(status.as_u16()),
            msg: body.to_string(),
        },
    }
}

/// Number that Binance may send either as a string or as JSON number.
fn num(v: &Value, field: &str) -> Result<f64, ExchangeError> {
    let raw = &v[field];
    if let Some(s) = raw.as_str() {
        s.parse::<f64>()
            .map_err(|_| ExchangeError::Decode(format!("'{field}' = '{s}' is not a number")))
    } else if let Some(n) = raw.as_f64() {
        Ok(n)
    } else {
        Err(ExchangeError::Decode(format!("missing numeric field '{field}'")))
    }
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn parse_position_side(v: &Value) -> Option<Side> {
    match v.as_str()? {
        "LONG" => Some(Side::Long),
        "SHORT" => Some(Side::Short),
        _ => None,
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn parse_open_order(v: &Value) -> Result<OpenOrder, ExchangeError> {
    let id = id_string(&v["orderId"]).ok_or_else(|| ExchangeError::Decode("order missing 'orderId'".into()))?;
    let side = match v["side"].as_str() {
        Some("BUY") => OrderSide::Buy,
        Some("SELL") => OrderSide::Sell,
        other => return Err(ExchangeError::Decode(format!("order {id}: bad side {other:?}"))),
    };
    let close_position = v["closePosition"].as_bool().unwrap_or(false);
    let trigger_price = num(v, "stopPrice").ok().filter(|p| *p > 0.0);
    let quantity = num(v, "origQty").ok().filter(|q| *q > 0.0 && !close_position);

    Ok(OpenOrder {
        symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
        kind: OrderKind::from_exchange_str(v["type"].as_str().unwrap_or_default()),
        side,
        position_side: parse_position_side(&v["positionSide"]),
        trigger_price,
        quantity,
        reduce_only: v["reduceOnly"].as_bool().unwrap_or(false),
        close_position,
        created_at: ms_to_datetime(v["time"].as_i64().unwrap_or_default()),
        client_id: v["clientOrderId"].as_str().unwrap_or_default().to_string(),
        id,
    })
}

/// `None` for flat rows, which positionRisk reports for every symbol.
fn parse_position(v: &Value) -> Result<Option<ExchangePosition>, ExchangeError> {
    let amt = num(v, "positionAmt")?;
    if amt == 0.0 {
        return Ok(None);
    }
    let side = parse_position_side(&v["positionSide"]).unwrap_or(if amt > 0.0 { Side::Long } else { Side::Short });
    Ok(Some(ExchangePosition {
        symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
        side,
        size: amt.abs(),
        entry_price: num(v, "entryPrice")?,
    }))
}

fn parse_rules(symbol: &Value) -> Result<SymbolRules, ExchangeError> {
    let filters = symbol["filters"]
        .as_array()
        .ok_or_else(|| ExchangeError::Decode("symbol missing 'filters'".into()))?;
    let find = |ty: &str| filters.iter().find(|f| f["filterType"].as_str() == Some(ty));

    let price = find("PRICE_FILTER").ok_or_else(|| ExchangeError::Decode("no PRICE_FILTER".into()))?;
    let lot = find("LOT_SIZE").ok_or_else(|| ExchangeError::Decode("no LOT_SIZE".into()))?;
    let rules = SymbolRules {
        price_increment: num(price, "tickSize")?,
        quantity_step: num(lot, "stepSize")?,
        min_qty: num(lot, "minQty")?,
    };
    if rules.price_increment <= 0.0 || rules.quantity_step <= 0.0 {
        return Err(ExchangeError::Decode("non-positive tick or step size".into()));
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_matches_binance_reference_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn public_client_refuses_signed_endpoints() {
        let client = BinanceClient::public(true).unwrap();
        assert!(matches!(client.signed_query("symbol=BTCUSDT"), Err(ExchangeError::Unsupported(_))));
        assert!(format!("{client:?}").contains("testnet"));
    }

    #[test]
    fn debug_output_redacts_secret() {
        let client = BinanceClient::new("my-key", "my-secret", true).unwrap();
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("my-secret"));
        assert!(!dbg.contains("my-key"));
    }

    #[test]
    fn error_mapping() {
        let nf = map_api_error(StatusCode::BAD_REQUEST, r#"{"code":-2011,"msg":"Unknown order sent."}"#);
        assert!(matches!(nf, ExchangeError::NotFound(_)));

        let rej = map_api_error(StatusCode::BAD_REQUEST, r#"{"code":-2021,"msg":"Order would immediately trigger."}"#);
        assert_eq!(
            rej,
            ExchangeError::Rejected { code: -2021, msg: "Order would immediately trigger.".into() }
        );

        assert!(map_api_error(StatusCode::BAD_GATEWAY, "upstream").is_transient());
        assert!(matches!(
            map_api_error(StatusCode::FORBIDDEN, "<html>waf</html>"),
            ExchangeError::Rejected { code: 403, .. }
        ));
    }

    #[test]
    fn one_way_stop_params() {
        let rules = SymbolRules { price_increment: 0.1, quantity_step: 0.001, min_qty: 0.001 };
        let req = OrderRequest::stop_loss("BTCUSDT", Side::Long, Some(0.5), 98.0, false);
        let p: HashMap<_, _> = order_params(&req, &rules).into_iter().collect();
        assert_eq!(p["side"], "SELL");
        assert_eq!(p["type"], "STOP_MARKET");
        assert_eq!(p["quantity"], "0.500");
        assert_eq!(p["stopPrice"], "98.0");
        assert_eq!(p["reduceOnly"], "true");
        assert!(!p.contains_key("positionSide"));
        assert!(!p.contains_key("closePosition"));
    }

    #[test]
    fn hedge_close_position_stop_params() {
        let rules = SymbolRules::default();
        let req = OrderRequest::stop_loss("ETHUSDT", Side::Short, None, 2100.5, true);
        let p: HashMap<_, _> = order_params(&req, &rules).into_iter().collect();
        assert_eq!(p["side"], "BUY");
        assert_eq!(p["positionSide"], "SHORT");
        assert_eq!(p["closePosition"], "true");
        assert!(!p.contains_key("quantity"));
        assert!(!p.contains_key("reduceOnly"));
    }

    #[test]
    fn hedge_take_profit_omits_reduce_only() {
        let req = OrderRequest::take_profit("ETHUSDT", Side::Long, 1.0, 2200.0, 1, true);
        let p: HashMap<_, _> = order_params(&req, &SymbolRules::default()).into_iter().collect();
        assert_eq!(p["positionSide"], "LONG");
        assert!(!p.contains_key("reduceOnly"));
        assert_eq!(p["type"], "TAKE_PROFIT_MARKET");
    }

    #[test]
    fn parses_close_position_stop() {
        let raw = json!({
            "orderId": 283194212,
            "symbol": "BTCUSDT",
            "type": "STOP_MARKET",
            "side": "SELL",
            "positionSide": "BOTH",
            "stopPrice": "96500.0",
            "origQty": "0",
            "reduceOnly": true,
            "closePosition": true,
            "time": 1_700_000_000_000_i64,
            "clientOrderId": "wd-sl-abc"
        });
        let o = parse_open_order(&raw).unwrap();
        assert_eq!(o.id, "283194212");
        assert!(o.is_stop_loss());
        assert_eq!(o.trigger_price, Some(96500.0));
        assert_eq!(o.quantity, None);
        assert_eq!(o.position_side, None);
        assert_eq!(o.target_side(), Side::Long);
        assert_eq!(o.created_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn parses_positions_in_both_modes() {
        let short = json!({"symbol": "ETHUSDT", "positionAmt": "-0.250", "entryPrice": "2000.5", "positionSide": "BOTH"});
        let p = parse_position(&short).unwrap().unwrap();
        assert_eq!(p.side, Side::Short);
        assert_eq!(p.size, 0.25);

        let hedge_long = json!({"symbol": "BTCUSDT", "positionAmt": "0.010", "entryPrice": "60000", "positionSide": "LONG"});
        assert_eq!(parse_position(&hedge_long).unwrap().unwrap().side, Side::Long);

        let flat = json!({"symbol": "XRPUSDT", "positionAmt": "0.0", "entryPrice": "0.0", "positionSide": "BOTH"});
        assert!(parse_position(&flat).unwrap().is_none());
    }

    #[test]
    fn parses_precision_filters() {
        let raw = json!({
            "symbol": "BTCUSDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                {"filterType": "MIN_NOTIONAL", "notional": "100"}
            ]
        });
        let r = parse_rules(&raw).unwrap();
        assert_eq!(r, SymbolRules { price_increment: 0.1, quantity_step: 0.001, min_qty: 0.001 });

        let broken = json!({"symbol": "X", "filters": [{"filterType": "LOT_SIZE", "stepSize": "1", "minQty": "1"}]});
        assert!(parse_rules(&broken).is_err());
    }
}

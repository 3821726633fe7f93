use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use wfcore::{
    param_str, NodeContext, NodeDescription, NodeError, NodeGroup, NodeOutput, NodeType,
    ParameterKind, ParameterSpec, RateLimit,
};

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeType for HttpRequestNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription::new("http.request", NodeGroup::Action)
            .display_name("HTTP Request")
            .description("Make HTTP requests")
            .category("http")
            .parameter(ParameterSpec::required("url", ParameterKind::String))
            .parameter(ParameterSpec::optional(
                "method",
                ParameterKind::String,
                Some(json!("GET")),
            ))
            .parameter(ParameterSpec::optional("headers", ParameterKind::Object, None))
            .parameter(ParameterSpec::optional("body", ParameterKind::Any, None))
            .parameter(
                ParameterSpec::optional("ignore_status", ParameterKind::Boolean, Some(json!(false)))
                    .describe("Succeed on non-2xx responses"),
            )
            .rate_limit(RateLimit {
                max_concurrent: Some(4),
                per_second: Some(10),
            })
    }

    fn validate(&self, parameters: &Value) -> Result<(), NodeError> {
        self.describe().validate_parameters(parameters)?;
        let method = param_str(parameters, "method").unwrap_or("GET");
        parse_method(method)?;
        Ok(())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url = ctx.require_str("url")?;
        let method = parse_method(param_str(&ctx.parameters, "method").unwrap_or("GET"))?;

        ctx.events.info(format!("{} {}", method, url));

        let mut request = self.client.request(method, url);
        if let Some(Value::Object(headers)) = ctx.parameters.get("headers") {
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    request = request.header(key, val_str);
                }
            }
        }
        request = match ctx.parameters.get("body") {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text.clone()),
            Some(body) => request.json(body),
        };

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;
        let body = serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));

        ctx.events.info(format!("Response status: {}", status.as_u16()));

        let ignore_status = ctx
            .parameters
            .get("ignore_status")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !status.is_success() && !ignore_status {
            return Err(NodeError::ExecutionFailed(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url
            )));
        }

        Ok(NodeOutput::main(json!({
            "status": status.as_u16(),
            "body": body,
            "headers": headers,
        })))
    }
}

fn parse_method(method: &str) -> Result<Method, NodeError> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        _ => Err(NodeError::Configuration(format!("Unsupported method: {}", method))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_are_case_insensitive() {
        assert_eq!(parse_method("post").unwrap(), Method::POST);
        assert!(parse_method("TRACE").is_err());
    }
}

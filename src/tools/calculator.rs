use serde_json::{Value, json};

use super::Tool;

/// Basic arithmetic over two operands.
pub struct CalculatorTool;

impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Performs basic arithmetic operations. Use exact operation names: 'add', 'subtract', 'multiply', 'divide'"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "description": "Operation to perform. Must be one of: 'add', 'subtract', 'multiply', 'divide'",
                    "enum": ["add", "subtract", "multiply", "divide"]
                },
                "a": { "type": "number", "description": "First number" },
                "b": { "type": "number", "description": "Second number" }
            },
            "required": ["operation", "a", "b"]
        })
    }

    fn execute(&self, params: Value) -> Result<String, String> {
        let operation = params
            .get("operation")
            .and_then(Value::as_str)
            .ok_or("missing 'operation' parameter")?;
        let a = number(&params, "a")?;
        let b = number(&params, "b")?;

        let result = match operation {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return Err("Division by zero".to_string());
                }
                a / b
            }
            other => return Err(format!("Unknown operation '{other}'")),
        };

        Ok(format!("Result: {result}"))
    }
}

fn number(params: &Value, key: &str) -> Result<f64, String> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("parameter '{key}' must be a number"))
}

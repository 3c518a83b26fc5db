use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::CaptchaSection;

use super::{CaptchaError, CaptchaSolver, ScoredChallenge};

/// Client for Anti-Captcha compatible `createTask` / `getTaskResult` APIs.
#[derive(Debug, Clone)]
pub struct AntiCaptchaClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    poll_interval: Duration,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest<'a> {
    client_key: &'a str,
    task: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultRequest<'a> {
    client_key: &'a str,
    task_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    error_id: i64,
    error_code: Option<String>,
    error_description: Option<String>,
    task_id: Option<i64>,
    status: Option<String>,
    solution: Option<Value>,
}

impl ApiResponse {
    fn into_result(self) -> Result<Self, CaptchaError> {
        if self.error_id != 0 {
            return Err(CaptchaError::Service {
                code: self.error_code.unwrap_or_else(|| format!("error_{}", self.error_id)),
                description: self.error_description.unwrap_or_default(),
            });
        }
        Ok(self)
    }
}

impl AntiCaptchaClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            poll_interval: Duration::from_secs(3),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(section: &CaptchaSection) -> Result<Self, CaptchaError> {
        let key = section.usable_api_key().ok_or_else(|| {
            CaptchaError::Unavailable("ANTICAPTCHA_API_KEY is not set".to_string())
        })?;
        Ok(Self::new(&section.api_url, key).with_polling(
            Duration::from_secs(section.poll_interval_seconds),
            Duration::from_secs(section.timeout_seconds),
        ))
    }

    pub fn with_polling(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    async fn call<T: Serialize + ?Sized>(
        &self,
        method: &str,
        body: &T,
    ) -> Result<ApiResponse, CaptchaError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.api_url))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        response.json::<ApiResponse>().await?.into_result()
    }

    async fn create_task(&self, task: Value) -> Result<i64, CaptchaError> {
        let request = CreateTaskRequest {
            client_key: &self.api_key,
            task,
        };
        let response = self.call("createTask", &request).await?;
        response
            .task_id
            .ok_or_else(|| CaptchaError::Decode("createTask response without taskId".to_string()))
    }

    async fn await_solution(&self, task_id: i64) -> Result<Value, CaptchaError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        loop {
            sleep(self.poll_interval).await;
            let request = TaskResultRequest {
                client_key: &self.api_key,
                task_id,
            };
            let response = self.call("getTaskResult", &request).await?;
            match response.status.as_deref() {
                Some("ready") => {
                    return response.solution.ok_or_else(|| {
                        CaptchaError::Decode(format!("task {task_id} ready without solution"))
                    });
                }
                status => debug!(task_id, ?status, "captcha task pending"),
            }
            if Instant::now() >= deadline {
                return Err(CaptchaError::Timeout {
                    task_id,
                    waited_seconds: started.elapsed().as_secs(),
                });
            }
        }
    }

    async fn solve(&self, task: Value, field: &str) -> Result<String, CaptchaError> {
        let task_id = self.create_task(task).await?;
        info!(task_id, "captcha task submitted");
        let solution = self.await_solution(task_id).await?;
        solution
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CaptchaError::Decode(format!("solution without {field}")))
    }
}

#[async_trait]
impl CaptchaSolver for AntiCaptchaClient {
    async fn solve_scored(&self, challenge: &ScoredChallenge) -> Result<String, CaptchaError> {
        let task = json!({
            "type": "RecaptchaV3TaskProxyless",
            "websiteURL": challenge.website_url,
            "websiteKey": challenge.site_key,
            "minScore": challenge.min_score,
            "pageAction": challenge.action,
        });
        self.solve(task, "gRecaptchaResponse").await
    }

    async fn solve_image(&self, image: &[u8]) -> Result<String, CaptchaError> {
        let task = json!({
            "type": "ImageToTextTask",
            "body": STANDARD.encode(image),
        });
        self.solve(task, "text").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AntiCaptchaClient {
        AntiCaptchaClient::new(server.uri(), "test-key")
            .with_polling(Duration::from_millis(10), Duration::from_secs(5))
    }

    fn challenge() -> ScoredChallenge {
        ScoredChallenge {
            website_url: "https://icp.test".into(),
            site_key: "6Lc-site".into(),
            action: "submit".into(),
            min_score: 0.9,
        }
    }

    #[tokio::test]
    async fn scored_challenge_polls_until_ready() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createTask"))
            .and(body_partial_json(json!({
                "clientKey": "test-key",
                "task": {
                    "type": "RecaptchaV3TaskProxyless",
                    "websiteKey": "6Lc-site",
                    "pageAction": "submit",
                    "minScore": 0.9
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "taskId": 7
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getTaskResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "status": "processing"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getTaskResult"))
            .and(body_partial_json(json!({ "taskId": 7 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "status": "ready",
                "solution": { "gRecaptchaResponse": "token-abc" }
            })))
            .mount(&server)
            .await;

        let token = client(&server).solve_scored(&challenge()).await.unwrap();
        assert_eq!(token, "token-abc");
    }

    #[tokio::test]
    async fn image_challenge_sends_base64_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createTask"))
            .and(body_partial_json(json!({
                "task": { "type": "ImageToTextTask", "body": "iVBORw==" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "taskId": 11
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getTaskResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "status": "ready",
                "solution": { "text": "x7k2p" }
            })))
            .mount(&server)
            .await;

        let text = client(&server)
            .solve_image(&[0x89, 0x50, 0x4e, 0x47])
            .await
            .unwrap();
        assert_eq!(text, "x7k2p");
    }

    #[tokio::test]
    async fn service_errors_surface_code_and_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createTask"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 1,
                "errorCode": "ERROR_KEY_DOES_NOT_EXIST",
                "errorDescription": "Account authorization key not found"
            })))
            .mount(&server)
            .await;

        let err = client(&server).solve_scored(&challenge()).await.unwrap_err();
        match err {
            CaptchaError::Service { code, .. } => assert_eq!(code, "ERROR_KEY_DOES_NOT_EXIST"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_tasks_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createTask"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "taskId": 3
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getTaskResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "status": "processing"
            })))
            .mount(&server)
            .await;

        let client = AntiCaptchaClient::new(server.uri(), "test-key")
            .with_polling(Duration::from_millis(10), Duration::from_millis(50));
        let err = client.solve_image(b"img").await.unwrap_err();
        assert!(matches!(err, CaptchaError::Timeout { task_id: 3, .. }));
    }

    #[test]
    fn placeholder_key_is_unavailable() {
        let section = CaptchaSection {
            api_key: Some("your_api_key_here".into()),
            ..CaptchaSection::default()
        };
        assert!(matches!(
            AntiCaptchaClient::from_config(&section),
            Err(CaptchaError::Unavailable(_))
        ));
    }
}

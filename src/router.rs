use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use axum::{
    extract::ConnectInfo,
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{any, get, post},
    Router,
};
use axum_extra::headers::{self, HeaderMapExt};
use tokio_util::sync::CancellationToken;

use crate::{
    action::{
        ActionError, ActionErrorCode, ActionPayload, ActionResponse, InArgumentPayload,
        OutArgumentPayload, SoapMessage,
    },
    device_description::DeviceData,
    device_host::ActionHandler,
    eventing::{
        subscriber::{send_notify, service_event_task, Subscriber},
        write_property_set, SubscribeError, SubscribeRequest, SubscriptionTimeout,
    },
    service::{Service, MAX_SUBSCRIBERS},
    ssdp::outbound_interface_for,
};

pub(crate) struct HostState {
    pub device: Arc<DeviceData>,
    pub handler: Arc<dyn ActionHandler>,
    pub notify_client: reqwest::Client,
    pub token: CancellationToken,
    pub server_header: String,
    pub strict_soap: bool,
    pub description_path: String,
}

/// Builds the http surface of a device host: description and SCPD documents,
/// SOAP control urls and GENA event urls for every service of the tree.
/// Profiles merge their own routes (media resources, presentation pages) on
/// top; everything unrouted answers 405.
pub(crate) fn make_router(state: Arc<HostState>) -> Router {
    let mut router = Router::new();

    let description_state = state.clone();
    router = router.route(
        &state.description_path,
        get(move || {
            let state = description_state.clone();
            async move { serve_description(state) }
        }),
    );

    for service in state.device.all_services(usize::MAX) {
        let urls = service.urls().clone();

        let scpd_service = service.clone();
        router = router.route(
            &urls.scpd,
            get(move || {
                let service = scpd_service.clone();
                async move { serve_scpd(service) }
            }),
        );

        let control_state = state.clone();
        let control_service = service.clone();
        router = router.route(
            &urls.control,
            post(move |headers: HeaderMap, body: String| {
                let state = control_state.clone();
                let service = control_service.clone();
                async move { handle_control(state, service, headers, body).await }
            }),
        );

        let event_state = state.clone();
        let event_service = service.clone();
        router = router.route(
            &urls.event_sub,
            any(move |request: axum::extract::Request| {
                let state = event_state.clone();
                let service = event_service.clone();
                async move {
                    let method = request.method().clone();
                    let remote = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|info| info.0);
                    let headers = request.headers().clone();
                    handle_event_url(state, service, method, remote, headers).await
                }
            }),
        );
    }

    router.fallback(|| async { StatusCode::METHOD_NOT_ALLOWED })
}

fn serve_description(state: Arc<HostState>) -> axum::response::Response {
    tracing::debug!("Serving device description");
    match state.device.description_xml() {
        Ok(description) => {
            let mut headers = HeaderMap::new();
            headers.typed_insert(headers::ContentType::xml());
            (headers, description).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to compose device description: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn serve_scpd(service: Arc<Service>) -> axum::response::Response {
    match service.scpd_xml() {
        Ok(scpd) => {
            let mut headers = HeaderMap::new();
            headers.typed_insert(headers::ContentType::xml());
            (headers, scpd).into_response()
        }
        Err(e) => {
            tracing::error!(
                service = service.service_id(),
                "Failed to serve scpd: {e}"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Parses the Soap request, validates it against the service schema and
/// routes it to the profile action handler
async fn handle_control(
    state: Arc<HostState>,
    service: Arc<Service>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    let soap_action = match soap_action_header(&headers) {
        Ok(soap_action) => soap_action,
        Err(e) => {
            tracing::debug!("Rejecting control request: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let (urn, action_name) = soap_action;
    if urn != service.urn().to_string() {
        tracing::debug!(
            expected = %service.urn(),
            got = urn,
            "SOAPAction urn does not match the resolved service"
        );
        return ActionError::from(ActionErrorCode::InvalidAction).into_response();
    }

    let payload: SoapMessage<ActionPayload<InArgumentPayload>> =
        match SoapMessage::from_xml(body.as_bytes(), state.strict_soap) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Malformed control request: {e}");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
    let payload = payload.into_inner();
    if payload.name() != action_name {
        tracing::warn!(
            "Inconsistency between soapaction header and payload: {} vs {}",
            action_name,
            payload.name(),
        );
    }
    tracing::info!(service = service.service_id(), "Action {action_name} invoked");

    let Some(action) = service.find_action(&action_name) else {
        return ActionError::from(ActionErrorCode::InvalidAction).into_response();
    };

    // in arguments must all be present, in descriptor order, with values the
    // related state variables accept
    let mut arguments = Vec::new();
    for declared in action.in_args() {
        let Some(payload_arg) = payload
            .arguments
            .iter()
            .find(|a| a.name() == declared.name)
        else {
            return ActionError::from(ActionErrorCode::InvalidArgs).into_response();
        };
        if let Err(e) =
            service.validate_argument_value(&declared.related_state_variable, &payload_arg.value)
        {
            tracing::debug!(argument = declared.name, "Invalid argument value: {e}");
            return ActionError::new(ActionErrorCode::NoSuchObject, "Invalid Name")
                .into_response();
        }
        arguments.push((declared.name.clone(), payload_arg.value.to_string()));
    }

    let outputs = match state
        .handler
        .on_action(service.clone(), &action, arguments)
        .await
    {
        Ok(outputs) => outputs,
        Err(e) => return e.into_response(),
    };

    let declared_outputs = action.out_args().count();
    if outputs.len() != declared_outputs {
        tracing::warn!(
            "Mismatched output arguments length from {} action ({}/{})",
            action.name(),
            outputs.len(),
            declared_outputs,
        );
    }

    ActionResponse {
        action_name: action.name().to_string(),
        service_urn: service.urn(),
        args: outputs
            .into_iter()
            .map(|(name, value)| OutArgumentPayload { name, value })
            .collect(),
    }
    .into_response()
}

fn soap_action_header(headers: &HeaderMap) -> anyhow::Result<(String, String)> {
    let mut header = headers
        .get("soapaction")
        .context("soapaction header")?
        .to_str()
        .context("convert header to string")?;
    if let Some(stripped) = header.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        header = stripped;
    }
    let (urn, action_name) = header.split_once('#').context("split soapaction header")?;
    Ok((urn.to_string(), action_name.to_string()))
}

async fn handle_event_url(
    state: Arc<HostState>,
    service: Arc<Service>,
    method: Method,
    remote: Option<SocketAddr>,
    headers: HeaderMap,
) -> axum::response::Response {
    let local_addr = remote
        .and_then(|remote| outbound_interface_for(remote).ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    match method.as_str() {
        "SUBSCRIBE" => handle_subscribe(state, service, local_addr, headers).await,
        "UNSUBSCRIBE" => handle_unsubscribe(service, headers),
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn handle_subscribe(
    state: Arc<HostState>,
    service: Arc<Service>,
    local_addr: IpAddr,
    headers: HeaderMap,
) -> axum::response::Response {
    let request = match SubscribeRequest::from_headers(&headers) {
        Ok(request) => request,
        Err(e) => return e.status_code().into_response(),
    };
    match request {
        SubscribeRequest::New { callbacks, timeout } => {
            if service.subscriber_count() >= MAX_SUBSCRIBERS {
                tracing::warn!(
                    service = service.service_id(),
                    "Rejecting subscription, subscriber limit reached"
                );
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            let initial = match service.initial_property_set() {
                Ok(initial) => initial,
                Err(e) => {
                    tracing::error!("Failed to build initial property set: {e}");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };
            let subscriber = Subscriber::new(callbacks, local_addr, timeout);
            tracing::debug!(
                service = service.service_id(),
                sid = subscriber.sid,
                "New subscription (timeout = {timeout:?})"
            );

            // new subscribers get every sendable variable right away; an
            // unreachable callback never enters the subscriber set
            let body = write_property_set(&initial);
            if let Err(e) = send_notify(
                &state.notify_client,
                &subscriber.callbacks,
                &subscriber.sid,
                subscriber.event_key.get(),
                &body,
            )
            .await
            {
                tracing::debug!("Initial notify failed: {e}");
                return StatusCode::PRECONDITION_FAILED.into_response();
            }

            let response = subscription_response(&state, &subscriber.sid, timeout);
            let mut subscriber = subscriber;
            subscriber.event_key.increment();
            service.insert_subscriber(subscriber);

            if service.begin_event_task() {
                tokio::spawn(service_event_task(
                    service.clone(),
                    state.notify_client.clone(),
                    state.token.child_token(),
                ));
            }
            response
        }
        SubscribeRequest::Renew { sid, timeout } => {
            match service.renew_subscriber(&sid, timeout, local_addr, Instant::now()) {
                Ok(()) => subscription_response(&state, &sid, timeout),
                Err(_) => StatusCode::PRECONDITION_FAILED.into_response(),
            }
        }
    }
}

fn handle_unsubscribe(service: Arc<Service>, headers: HeaderMap) -> axum::response::Response {
    if headers.contains_key("nt") || headers.contains_key("callback") {
        return SubscribeError::IncompatibleHeaders.status_code().into_response();
    }
    let Some(sid) = headers.get("sid").and_then(|v| v.to_str().ok()) else {
        return StatusCode::PRECONDITION_FAILED.into_response();
    };
    if service.remove_subscriber(sid) {
        StatusCode::OK.into_response()
    } else {
        StatusCode::PRECONDITION_FAILED.into_response()
    }
}

fn subscription_response(
    state: &HostState,
    sid: &str,
    timeout: std::time::Duration,
) -> axum::response::Response {
    let mut headers = HeaderMap::new();
    headers.insert("SID", sid.parse().expect("sid is a valid header value"));
    headers.insert(
        "TIMEOUT",
        SubscriptionTimeout::Seconds(timeout.as_secs() as u32)
            .to_string()
            .parse()
            .expect("timeout is a valid header value"),
    );
    headers.insert(
        "SERVER",
        state
            .server_header
            .parse()
            .expect("server header is a valid header value"),
    );
    (StatusCode::OK, headers).into_response()
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, sync::Arc};

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{HeaderMap, Request, StatusCode},
        Router,
    };
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::{
        action::{ActionDesc, ActionError, ActionErrorCode, ArgumentDesc, ArgumentDirection},
        device_description::DeviceData,
        device_host::ActionHandler,
        service::{Service, ServiceUrls},
        service_variables::{DataType, StateVariable},
        templates::service_description::Scpd,
        urn::{ServiceType, URN},
    };

    use super::{make_router, HostState};

    struct BrowseHandler;

    #[async_trait]
    impl ActionHandler for BrowseHandler {
        async fn on_action(
            &self,
            _service: Arc<Service>,
            action: &ActionDesc,
            arguments: Vec<(String, String)>,
        ) -> Result<Vec<(String, String)>, ActionError> {
            match action.name() {
                "Browse" => {
                    let object_id = arguments
                        .iter()
                        .find(|(name, _)| name == "ObjectID")
                        .map(|(_, value)| value.as_str())
                        .unwrap_or_default();
                    if object_id == "nonexistent" {
                        return Err(ActionError::from(ActionErrorCode::NoSuchObject));
                    }
                    Ok(vec![("Result".to_string(), "<DIDL-Lite/>".to_string())])
                }
                _ => Err(ActionError::from(ActionErrorCode::InvalidAction)),
            }
        }
    }

    fn content_directory_scpd() -> Scpd {
        Scpd::new()
            .with_state_variable(
                StateVariable::new("SystemUpdateID", DataType::Ui4)
                    .with_send_events(true)
                    .with_default("0"),
            )
            .with_state_variable(StateVariable::new("A_ARG_TYPE_ObjectID", DataType::String))
            .with_state_variable(
                StateVariable::new("A_ARG_TYPE_BrowseFlag", DataType::String)
                    .with_allowed_values(["BrowseMetadata", "BrowseDirectChildren"]),
            )
            .with_state_variable(StateVariable::new("A_ARG_TYPE_Result", DataType::String))
            .with_action(ActionDesc {
                name: "Browse".to_string(),
                arguments: vec![
                    ArgumentDesc {
                        name: "ObjectID".to_string(),
                        direction: ArgumentDirection::In,
                        related_state_variable: "A_ARG_TYPE_ObjectID".to_string(),
                        retval: false,
                    },
                    ArgumentDesc {
                        name: "BrowseFlag".to_string(),
                        direction: ArgumentDirection::In,
                        related_state_variable: "A_ARG_TYPE_BrowseFlag".to_string(),
                        retval: false,
                    },
                    ArgumentDesc {
                        name: "Result".to_string(),
                        direction: ArgumentDirection::Out,
                        related_state_variable: "A_ARG_TYPE_Result".to_string(),
                        retval: true,
                    },
                ],
            })
    }

    fn test_router() -> (Router, Arc<DeviceData>) {
        let uuid = uuid::Uuid::new_v4();
        let service = Service::new(
            URN::upnp_service(ServiceType::ContentDirectory, 1),
            "urn:upnp-org:serviceId:ContentDirectory",
            ServiceUrls::for_service("content_directory", uuid),
        )
        .with_scpd(content_directory_scpd());
        let device = crate::device_description::DeviceData::builder(
            URN::media_server(),
            "Test server",
        )
        .uuid(uuid)
        .service(service)
        .build(reqwest::Url::parse("http://127.0.0.1:9999/").unwrap());
        for service in device.all_services(usize::MAX) {
            service.attach();
        }
        let state = Arc::new(HostState {
            device: device.clone(),
            handler: Arc::new(BrowseHandler),
            notify_client: reqwest::Client::new(),
            token: CancellationToken::new(),
            server_header: "test/1.0 UPnP/1.0 upnp/0.1".to_string(),
            strict_soap: true,
            description_path: "/".to_string(),
        });
        (make_router(state), device)
    }

    fn service_urls(device: &DeviceData) -> ServiceUrls {
        device.services()[0].urls().clone()
    }

    fn browse_envelope(object_id: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:Browse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1">
<ObjectID>{object_id}</ObjectID>
<BrowseFlag>BrowseDirectChildren</BrowseFlag>
</u:Browse>
</s:Body>
</s:Envelope>"#
        )
    }

    fn control_request(url: &str, soap_action: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(url)
            .header("SOAPAction", soap_action)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    const BROWSE_SOAP_ACTION: &str =
        "\"urn:schemas-upnp-org:service:ContentDirectory:1#Browse\"";

    #[tokio::test]
    async fn serves_description_and_scpd() {
        let (router, device) = test_router();
        let urls = service_urls(&device);

        let response = router
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("urn:schemas-upnp-org:device:MediaServer:1"));

        let response = router
            .oneshot(Request::get(urls.scpd.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("SystemUpdateID"));
    }

    #[tokio::test]
    async fn control_dispatches_to_handler() {
        let (router, device) = test_router();
        let urls = service_urls(&device);
        let response = router
            .oneshot(control_request(
                &urls.control,
                BROWSE_SOAP_ACTION,
                browse_envelope("0"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("u:BrowseResponse"));
        assert!(body.contains("Result"));
    }

    #[tokio::test]
    async fn action_error_becomes_fault() {
        let (router, device) = test_router();
        let urls = service_urls(&device);
        let response = router
            .oneshot(control_request(
                &urls.control,
                BROWSE_SOAP_ACTION,
                browse_envelope("nonexistent"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert!(body.contains("<errorCode>701</errorCode>"));
        assert!(body.contains("No Such Object."));
    }

    #[tokio::test]
    async fn unknown_action_is_401() {
        let (router, device) = test_router();
        let urls = service_urls(&device);
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:Destroy xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1"></u:Destroy></s:Body>
</s:Envelope>"#;
        let response = router
            .oneshot(control_request(
                &urls.control,
                "\"urn:schemas-upnp-org:service:ContentDirectory:1#Destroy\"",
                body.to_string(),
            ))
            .await
            .unwrap();
        let body = body_string(response).await;
        assert!(body.contains("<errorCode>401</errorCode>"));
    }

    #[tokio::test]
    async fn missing_in_argument_is_402() {
        let (router, device) = test_router();
        let urls = service_urls(&device);
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:Browse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1">
<ObjectID>0</ObjectID>
</u:Browse></s:Body>
</s:Envelope>"#;
        let response = router
            .oneshot(control_request(
                &urls.control,
                BROWSE_SOAP_ACTION,
                body.to_string(),
            ))
            .await
            .unwrap();
        let body = body_string(response).await;
        assert!(body.contains("<errorCode>402</errorCode>"));
    }

    #[tokio::test]
    async fn invalid_argument_value_is_701() {
        let (router, device) = test_router();
        let urls = service_urls(&device);
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:Browse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1">
<ObjectID>0</ObjectID>
<BrowseFlag>BrowseEverything</BrowseFlag>
</u:Browse></s:Body>
</s:Envelope>"#;
        let response = router
            .oneshot(control_request(
                &urls.control,
                BROWSE_SOAP_ACTION,
                body.to_string(),
            ))
            .await
            .unwrap();
        let body = body_string(response).await;
        assert!(body.contains("<errorCode>701</errorCode>"));
    }

    #[tokio::test]
    async fn mismatched_soap_action_urn_is_401() {
        let (router, device) = test_router();
        let urls = service_urls(&device);
        let response = router
            .oneshot(control_request(
                &urls.control,
                "\"urn:schemas-upnp-org:service:AVTransport:1#Browse\"",
                browse_envelope("0"),
            ))
            .await
            .unwrap();
        let body = body_string(response).await;
        assert!(body.contains("<errorCode>401</errorCode>"));
    }

    #[tokio::test]
    async fn subscribe_rejects_bad_headers() {
        let (router, device) = test_router();
        let urls = service_urls(&device);

        // NT missing entirely
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("SUBSCRIBE")
                    .uri(urls.event_sub.as_str())
                    .header("CALLBACK", "<http://127.0.0.1:1/cb>")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

        // SID mixed with NT
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("SUBSCRIBE")
                    .uri(urls.event_sub.as_str())
                    .header("SID", "uuid:whatever")
                    .header("NT", "upnp:event")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // GET on the event url is not routable
        let response = router
            .oneshot(Request::get(urls.event_sub.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn subscribe_with_unreachable_callback_is_412() {
        let (router, device) = test_router();
        let urls = service_urls(&device);
        let response = router
            .oneshot(
                Request::builder()
                    .method("SUBSCRIBE")
                    .uri(urls.event_sub.as_str())
                    .header("NT", "upnp:event")
                    // nothing listens here, the initial notify must fail
                    .header("CALLBACK", "<http://127.0.0.1:9/cb>")
                    .header("TIMEOUT", "Second-300")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(device.services()[0].subscriber_count(), 0);
    }

    /// Collects NOTIFY deliveries of the host under test
    async fn spawn_callback_receiver(
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<(HeaderMap, String)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let app = Router::new().fallback(
            move |headers: HeaderMap, body: String| {
                let tx = tx.clone();
                async move {
                    tx.send((headers, body)).ok();
                    StatusCode::OK
                }
            },
        );
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let url = format!("http://{}/cb", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (url, rx)
    }

    #[tokio::test]
    async fn subscribe_notify_unsubscribe_flow() {
        let (router, device) = test_router();
        let urls = service_urls(&device);
        let service = device.services()[0].clone();
        let (callback_url, mut notifications) = spawn_callback_receiver().await;

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("SUBSCRIBE")
                    .uri(urls.event_sub.as_str())
                    .header("NT", "upnp:event")
                    .header("CALLBACK", format!("<{callback_url}>"))
                    .header("TIMEOUT", "Second-300")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let sid = response
            .headers()
            .get("sid")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(sid.starts_with("uuid:"));
        assert_eq!(
            response.headers().get("timeout").unwrap().to_str().unwrap(),
            "Second-300"
        );
        assert_eq!(service.subscriber_count(), 1);

        // initial notify carries every sendable variable with SEQ 0
        let (headers, body) = notifications.recv().await.unwrap();
        assert_eq!(headers.get("seq").unwrap(), "0");
        assert_eq!(headers.get("sid").unwrap().to_str().unwrap(), sid);
        assert_eq!(headers.get("nts").unwrap(), "upnp:propchange");
        assert!(body.contains("SystemUpdateID"));

        // renewal echoes the sid
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("SUBSCRIBE")
                    .uri(urls.event_sub.as_str())
                    .header("SID", sid.clone())
                    .header("TIMEOUT", "Second-1800")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("UNSUBSCRIBE")
                    .uri(urls.event_sub.as_str())
                    .header("SID", sid.clone())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(service.subscriber_count(), 0);

        // the subscription is gone
        let response = router
            .oneshot(
                Request::builder()
                    .method("UNSUBSCRIBE")
                    .uri(urls.event_sub.as_str())
                    .header("SID", sid)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }
}

use async_trait::async_trait;
use graphql_parser::query::{Definition, Document, OperationDefinition, SelectionSet};
use reqwest::StatusCode;
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use crate::{
    GraphQLResponse, ServiceConfig, SubgraphRequest,
    composer::{SchemaComposer, SdlComposer},
    dispatcher::Dispatcher,
    ownership::{CollisionPolicy, OwnershipIndex},
    resolve_info::OperationContext,
    schema_registry::{ServiceRegistry, ServiceRuntime},
    selection_rewriter::SelectionRewriter,
    transport::{RequestContext, Transport, TransportError},
};

/// Replays canned responses in order and remembers every request it was sent.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    replies: Mutex<VecDeque<Value>>,
    requests: Mutex<Vec<SubgraphRequest>>,
}

impl RecordingTransport {
    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(RecordingTransport::default())
    }

    pub(crate) fn replying(replies: Vec<Value>) -> Arc<Self> {
        Arc::new(RecordingTransport {
            replies: Mutex::new(replies.into()),
            requests: Mutex::default(),
        })
    }

    pub(crate) fn requests(&self) -> Vec<SubgraphRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn execute(
        &self,
        request: &SubgraphRequest,
        _ctx: &RequestContext,
    ) -> Result<GraphQLResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(reply) => serde_json::from_value(reply).map_err(TransportError::InvalidBody),
            None => Err(TransportError::UnexpectedStatus(
                StatusCode::SERVICE_UNAVAILABLE,
            )),
        }
    }

    fn close(&self) {}
}

pub(crate) fn runtime(name: &str, sdl: &str) -> ServiceRuntime {
    runtime_with(name, sdl, RecordingTransport::empty())
}

pub(crate) fn runtime_with(
    name: &str,
    sdl: &str,
    transport: Arc<RecordingTransport>,
) -> ServiceRuntime {
    ServiceRuntime::from_sdl(
        ServiceConfig::new(name, format!("http://{name}/graphql")),
        transport,
        sdl.to_string(),
    )
    .unwrap()
}

/// Parses and prints a document so comparisons ignore whitespace.
pub(crate) fn normalize(query: &str) -> String {
    graphql_parser::parse_query::<String>(query)
        .unwrap()
        .to_string()
}

pub(crate) fn print_selection_set(selection_set: SelectionSet<'_, String>) -> String {
    Document {
        definitions: vec![Definition::Operation(OperationDefinition::SelectionSet(
            selection_set,
        ))],
    }
    .to_string()
}

/// A wired gateway core over recording transports.
pub(crate) struct Federation {
    pub(crate) dispatcher: Dispatcher,
    transports: HashMap<String, Arc<RecordingTransport>>,
}

impl Federation {
    pub(crate) fn new(sdls: &[(&str, &str)]) -> Self {
        Self::replying(
            sdls.iter()
                .map(|(name, sdl)| (*name, *sdl, Vec::new()))
                .collect(),
        )
    }

    pub(crate) fn replying(services: Vec<(&str, &str, Vec<Value>)>) -> Self {
        let mut transports = HashMap::new();
        let mut runtimes = Vec::new();
        for (name, sdl, replies) in services {
            let transport = RecordingTransport::replying(replies);
            transports.insert(name.to_string(), transport.clone());
            runtimes.push(runtime_with(name, sdl, transport));
        }

        let registry = ServiceRegistry::from_runtimes(runtimes);
        let index = OwnershipIndex::build(registry.services(), CollisionPolicy::FailFast).unwrap();
        let mut schema = SdlComposer.compose(registry.services()).unwrap();
        Dispatcher::wire(&mut schema, &index, &registry);

        Federation {
            dispatcher: Dispatcher::new(Arc::new(schema), Arc::new(index), Arc::new(registry)),
            transports,
        }
    }

    pub(crate) fn rewriter<'a, 'q>(
        &'a self,
        service: &str,
        operation: &'a OperationContext<'a, 'q>,
    ) -> SelectionRewriter<'a, 'q> {
        SelectionRewriter::new(
            self.dispatcher.schema(),
            self.dispatcher.index(),
            self.dispatcher.registry().get(service).unwrap(),
            operation,
        )
    }

    pub(crate) fn requests(&self, service: &str) -> Vec<SubgraphRequest> {
        self.transports[service].requests()
    }
}

extern crate proc_macro;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, Lit};

/// Implements the element traits for a flow node struct and submits its
/// `MetaNode` record to the inventory registry.
///
/// The attribute argument is the node type name as it appears in the flows
/// JSON, e.g. `#[flow_node("inject")]`.
#[proc_macro_attribute]
pub fn flow_node(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);

    let struct_name = &input.ident;

    let lit = parse_macro_input!(attr as Lit);
    let node_type = match lit {
        Lit::Str(lit_str) => lit_str.value(),
        _ => panic!("Expected a string literal for the node type"),
    };

    let expanded = quote! {
        #input

        impl FlowsElement for #struct_name {
            fn id(&self) -> ElementId {
                self.get_base().id
            }

            fn name(&self) -> &str {
                &self.get_base().name
            }

            fn type_str(&self) -> &'static str {
                self.get_base().type_str
            }

            fn ordering(&self) -> usize {
                self.get_base().ordering
            }

            fn is_disabled(&self) -> bool {
                self.get_base().disabled
            }

            fn parent_element(&self) -> Option<ElementId> {
                self.get_base().flow.upgrade().map(|x| x.id())
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn get_path(&self) -> String {
                match self.get_base().flow.upgrade() {
                    Some(flow) => format!("{}/{}", flow.get_path(), self.id()),
                    None => self.id().to_string(),
                }
            }
        }

        impl ContextHolder for #struct_name {
            fn context(&self) -> Arc<Context> {
                self.get_base().context.clone()
            }
        }

        ::inventory::submit! {
            MetaNode {
                kind: NodeKind::Flow,
                type_: #node_type,
                factory: NodeFactory::Flow(#struct_name::build),
            }
        }
    }; // quote!

    TokenStream::from(expanded)
}

#[proc_macro_attribute]
pub fn global_node(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);

    let struct_name = &input.ident;

    let lit = parse_macro_input!(attr as Lit);
    let node_type = match lit {
        Lit::Str(lit_str) => lit_str.value(),
        _ => panic!("Expected a string literal for the node type"),
    };

    let expanded = quote! {
        #input

        impl FlowsElement for #struct_name {
            fn id(&self) -> ElementId {
                self.get_base().id
            }

            fn name(&self) -> &str {
                &self.get_base().name
            }

            fn type_str(&self) -> &'static str {
                self.get_base().type_str
            }

            fn ordering(&self) -> usize {
                self.get_base().ordering
            }

            fn is_disabled(&self) -> bool {
                self.get_base().disabled
            }

            fn parent_element(&self) -> Option<ElementId> {
                None
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn get_path(&self) -> String {
                self.id().to_string()
            }
        }

        impl ContextHolder for #struct_name {
            fn context(&self) -> Arc<Context> {
                self.get_base().context.clone()
            }
        }

        ::inventory::submit! {
            MetaNode {
                kind: NodeKind::Global,
                type_: #node_type,
                factory: NodeFactory::Global(#struct_name::build),
            }
        }

    }; // quote!
    TokenStream::from(expanded)
}
